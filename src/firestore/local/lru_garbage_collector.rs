//! Least-recently-used garbage collection of inactive targets and the
//! documents only they referenced.

use std::collections::{BTreeSet, BinaryHeap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::firestore::core::types::{ListenSequenceNumber, TargetId};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::mutation_queue;
use crate::firestore::local::persistence::{is_primary_lease_lost, PersistenceTransaction};
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::{self, TargetCache};
use crate::firestore::model::DocumentKey;
use crate::firestore::util::{AsyncQueue, DelayedOperation, TimerId};

pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;
pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
const DEFAULT_PERCENTILE_TO_COLLECT: u32 = 10;
const DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT: usize = 1000;

const INITIAL_GC_DELAY: Duration = Duration::from_secs(60);
const REGULAR_GC_DELAY: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug, PartialEq)]
pub struct LruParams {
    /// Cache size in bytes above which a collection runs, or
    /// [`LruParams::DISABLED`].
    pub cache_size_collection_threshold: i64,
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl LruParams {
    /// Threshold value that turns collection off.
    pub const DISABLED: i64 = -1;

    pub fn with_cache_size(cache_size: i64) -> FirestoreResult<Self> {
        if cache_size != LruParams::DISABLED && cache_size < MINIMUM_CACHE_SIZE_BYTES {
            return Err(invalid_argument(format!(
                "cache size must be at least {MINIMUM_CACHE_SIZE_BYTES} bytes"
            )));
        }
        Ok(Self {
            cache_size_collection_threshold: cache_size,
            ..Self::default()
        })
    }

    pub fn disabled() -> Self {
        Self {
            cache_size_collection_threshold: LruParams::DISABLED,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache_size_collection_threshold != LruParams::DISABLED
    }
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_collection_threshold: DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: DEFAULT_PERCENTILE_TO_COLLECT,
            maximum_sequence_numbers_to_collect: DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    fn skipped() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug)]
pub struct LruGarbageCollector {
    params: LruParams,
    target_cache: TargetCache,
    remote_documents: RemoteDocumentCache,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self {
            params,
            target_cache: TargetCache::new(),
            remote_documents: RemoteDocumentCache::new(),
        }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    /// Runs a collection if the cache has outgrown its threshold.
    ///
    /// Targets in `active_target_ids` are never removed, and neither are
    /// documents in `pinned` or documents with pending writes.
    pub fn collect(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
        pinned: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<LruResults> {
        if !self.params.is_enabled() {
            log::debug!("Garbage collection skipped; disabled");
            return Ok(LruResults::skipped());
        }
        let cache_size = self.remote_documents.get_size(txn)?;
        if cache_size < self.params.cache_size_collection_threshold {
            log::debug!(
                "Garbage collection skipped; cache size {cache_size} is lower than threshold {}",
                self.params.cache_size_collection_threshold
            );
            return Ok(LruResults::skipped());
        }
        self.run_garbage_collection(txn, active_target_ids, pinned)
    }

    fn run_garbage_collection(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
        pinned: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<LruResults> {
        let mut count =
            self.sequence_number_count(txn)? * self.params.percentile_to_collect as usize / 100;
        if count > self.params.maximum_sequence_numbers_to_collect {
            log::debug!(
                "Capping sequence numbers to collect down to the maximum of {} from {count}",
                self.params.maximum_sequence_numbers_to_collect
            );
            count = self.params.maximum_sequence_numbers_to_collect;
        }
        let Some(upper_bound) = self.nth_sequence_number(txn, count)? else {
            return Ok(LruResults {
                did_run: true,
                ..LruResults::default()
            });
        };
        let targets_removed = self
            .target_cache
            .remove_targets(txn, upper_bound, active_target_ids)?;
        let documents_removed = self.remove_orphaned_documents(txn, upper_bound, pinned)?;
        log::debug!(
            "LRU garbage collection: removed {targets_removed} targets and {documents_removed} documents up to sequence number {upper_bound}"
        );
        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected: count,
            targets_removed,
            documents_removed,
        })
    }

    /// Number of targets plus documents no target references.
    fn sequence_number_count(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<usize> {
        let mut count = self.target_cache.get_target_count(txn)? as usize;
        for (key, _) in target_cache::sentinel_rows(txn)? {
            if !target_cache::is_referenced_by_target(txn, &key)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// The `n`th lowest sequence number among targets and orphaned
    /// documents, or `None` when `n` is zero or there are no candidates.
    pub fn nth_sequence_number(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        n: usize,
    ) -> FirestoreResult<Option<ListenSequenceNumber>> {
        if n == 0 {
            return Ok(None);
        }
        let mut buffer = RollingSequenceNumberBuffer::new(n);
        for target_data in self.target_cache.all_targets(txn)? {
            buffer.add(target_data.sequence_number);
        }
        for (key, sequence_number) in target_cache::sentinel_rows(txn)? {
            if !target_cache::is_referenced_by_target(txn, &key)? {
                buffer.add(sequence_number);
            }
        }
        Ok(buffer.max_value())
    }

    fn remove_orphaned_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
        pinned: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<usize> {
        let mut removed = 0;
        for (key, sequence_number) in target_cache::sentinel_rows(txn)? {
            if sequence_number > upper_bound
                || pinned.contains(&key)
                || target_cache::is_referenced_by_target(txn, &key)?
                || mutation_queue::any_queue_contains_key(txn, &key)?
            {
                continue;
            }
            self.remote_documents.remove_entry(txn, &key)?;
            target_cache::remove_sentinel(txn, &key)?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// Keeps the `max_elements` lowest sequence numbers seen so far.
struct RollingSequenceNumberBuffer {
    heap: BinaryHeap<ListenSequenceNumber>,
    max_elements: usize,
}

impl RollingSequenceNumberBuffer {
    fn new(max_elements: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(max_elements),
            max_elements,
        }
    }

    fn add(&mut self, sequence_number: ListenSequenceNumber) {
        if self.heap.len() < self.max_elements {
            self.heap.push(sequence_number);
        } else if let Some(mut highest) = self.heap.peek_mut() {
            if sequence_number < *highest {
                *highest = sequence_number;
            }
        }
    }

    fn max_value(&self) -> Option<ListenSequenceNumber> {
        self.heap.peek().copied()
    }
}

/// Runs garbage collection on the client's queue one minute after start and
/// every five minutes after that, while the client is primary.
pub struct LruScheduler {
    enabled: bool,
    queue: AsyncQueue,
    task: StdMutex<Option<DelayedOperation>>,
}

impl LruScheduler {
    pub fn new(params: &LruParams, queue: AsyncQueue) -> Arc<Self> {
        Arc::new(Self {
            enabled: params.is_enabled(),
            queue,
            task: StdMutex::new(None),
        })
    }

    pub fn is_started(&self) -> bool {
        self.task.lock().unwrap().is_some()
    }

    pub fn start(self: &Arc<Self>, local_store: Arc<LocalStore>) {
        if self.enabled && !self.is_started() {
            self.schedule(local_store, INITIAL_GC_DELAY);
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.cancel();
        }
    }

    fn schedule(self: &Arc<Self>, local_store: Arc<LocalStore>, delay: Duration) {
        let scheduler = Arc::clone(self);
        let task = self
            .queue
            .enqueue_after_delay(TimerId::LruGarbageCollection, delay, move || async move {
                match local_store.collect_garbage().await {
                    Ok(results) => log::debug!("Garbage collection finished: {results:?}"),
                    Err(err) if err.is_storage_transaction() || is_primary_lease_lost(&err) => {
                        log::debug!("Ignoring error during garbage collection: {err}");
                    }
                    Err(err) => {
                        scheduler.task.lock().unwrap().take();
                        return Err(err);
                    }
                }
                if scheduler.is_started() {
                    scheduler.schedule(local_store, REGULAR_GC_DELAY);
                }
                Ok(())
            });
        *self.task.lock().unwrap() = Some(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::kv_store::{KvStore, MemoryKvStore};
    use crate::firestore::local::mutation_queue::MutationQueue;
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::target_data::{TargetData, TargetPurpose};
    use crate::firestore::model::{Document, DocumentState, Mutation, ResourcePath, SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn collect_everything() -> LruGarbageCollector {
        LruGarbageCollector::new(LruParams {
            cache_size_collection_threshold: 0,
            percentile_to_collect: 100,
            ..LruParams::default()
        })
    }

    fn run<T>(store: &MemoryKvStore, f: impl FnOnce(&mut PersistenceTransaction<'_>) -> T) -> T {
        let mut txn = PersistenceTransaction::new(store.begin().unwrap(), TransactionMode::ReadWrite);
        let result = f(&mut txn);
        txn.commit().unwrap();
        result
    }

    fn add_doc(txn: &mut PersistenceTransaction<'_>, path: &str) {
        let doc = Document::new(key(path), SnapshotVersion::from_seconds(1), MapValue::empty(), DocumentState::Synced);
        RemoteDocumentCache::new()
            .add_entry(txn, &doc.into(), SnapshotVersion::from_seconds(1))
            .unwrap();
    }

    #[test]
    fn rolling_buffer_keeps_the_lowest_values() {
        let mut buffer = RollingSequenceNumberBuffer::new(3);
        assert_eq!(buffer.max_value(), None);
        for sequence_number in [9, 4, 7, 1, 8, 2, 6] {
            buffer.add(sequence_number);
        }
        assert_eq!(buffer.heap.len(), 3);
        assert_eq!(buffer.max_value(), Some(4));
    }

    #[test]
    fn nth_sequence_number_spans_more_candidates_than_requested() {
        let store = MemoryKvStore::new();
        let cache = TargetCache::new();
        let gc = collect_everything();
        run(&store, |txn| {
            for (target_id, sequence_number) in [(2, 50), (4, 10), (6, 40), (8, 20), (10, 30)] {
                let path = ResourcePath::from_string(&format!("rooms{target_id}")).unwrap();
                let target = Query::at_path(path).to_target();
                let data = TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number);
                cache.add_target_data(txn, &data).unwrap();
            }
        });
        run(&store, |txn| {
            assert_eq!(gc.nth_sequence_number(txn, 0).unwrap(), None);
            assert_eq!(gc.nth_sequence_number(txn, 1).unwrap(), Some(10));
            assert_eq!(gc.nth_sequence_number(txn, 3).unwrap(), Some(30));
            assert_eq!(gc.nth_sequence_number(txn, 5).unwrap(), Some(50));
        });
    }

    #[test]
    fn rejects_tiny_cache_sizes() {
        assert!(LruParams::with_cache_size(1024).is_err());
        assert!(LruParams::with_cache_size(LruParams::DISABLED).is_ok());
        assert!(LruParams::with_cache_size(MINIMUM_CACHE_SIZE_BYTES).is_ok());
    }

    #[test]
    fn skips_collection_below_threshold() {
        let store = MemoryKvStore::new();
        let gc = LruGarbageCollector::new(LruParams::default());
        let results = run(&store, |txn| {
            add_doc(txn, "rooms/a");
            gc.collect(txn, &BTreeSet::new(), &BTreeSet::new()).unwrap()
        });
        assert!(!results.did_run);
    }

    #[test]
    fn removes_inactive_targets_and_orphaned_documents() {
        let store = MemoryKvStore::new();
        let cache = TargetCache::new();
        let gc = collect_everything();
        run(&store, |txn| {
            add_doc(txn, "rooms/a");
            add_doc(txn, "rooms/b");
            let sequence_number = txn.current_sequence_number().unwrap();
            let target = Query::at_path(ResourcePath::from_string("rooms").unwrap()).to_target();
            let data = TargetData::new(target, 2, TargetPurpose::Listen, sequence_number);
            cache.add_target_data(txn, &data).unwrap();
            cache.add_matching_keys(txn, [&key("rooms/a")], 2).unwrap();
        });

        let results = run(&store, |txn| {
            gc.collect(txn, &BTreeSet::new(), &BTreeSet::new()).unwrap()
        });
        assert!(results.did_run);
        assert_eq!(results.targets_removed, 1);
        assert_eq!(results.documents_removed, 2);
        assert_eq!(store.row_count(crate::firestore::local::kv_store::Table::RemoteDocuments), 0);
    }

    #[test]
    fn keeps_active_pinned_and_mutated_documents() {
        let store = MemoryKvStore::new();
        let cache = TargetCache::new();
        let gc = collect_everything();
        run(&store, |txn| {
            for path in ["rooms/active", "rooms/pinned", "rooms/mutated", "rooms/orphan"] {
                add_doc(txn, path);
            }
            let sequence_number = txn.current_sequence_number().unwrap();
            let target = Query::at_path(ResourcePath::from_string("rooms").unwrap()).to_target();
            let data = TargetData::new(target, 2, TargetPurpose::Listen, sequence_number);
            cache.add_target_data(txn, &data).unwrap();
            cache.add_matching_keys(txn, [&key("rooms/active")], 2).unwrap();
            MutationQueue::new("")
                .add_mutation_batch(
                    txn,
                    Timestamp::now(),
                    vec![],
                    vec![Mutation::set(key("rooms/mutated"), MapValue::empty())],
                )
                .unwrap();
        });

        let results = run(&store, |txn| {
            gc.collect(txn, &BTreeSet::from([2]), &BTreeSet::from([key("rooms/pinned")]))
                .unwrap()
        });
        assert_eq!(results.targets_removed, 0);
        assert_eq!(results.documents_removed, 1);
        run(&store, |txn| {
            let remote = RemoteDocumentCache::new();
            assert!(remote.get_entry(txn, &key("rooms/orphan")).unwrap().is_none());
            for path in ["rooms/active", "rooms/pinned", "rooms/mutated"] {
                assert!(remote.get_entry(txn, &key(path)).unwrap().is_some(), "{path}");
            }
        });
    }
}
