//! The local store ties the persisted caches together: the current user's
//! mutation queue, the remote document cache and the target cache.
//!
//! Every operation runs in a single persistence transaction. In-memory state
//! (active target data, local view references, the batch key cache) is only
//! updated after that transaction committed, so a retried transaction never
//! observes its own partial effects.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex};

use crate::firestore::core::query::Query;
use crate::firestore::core::target::Target;
use crate::firestore::core::types::{BatchId, TargetId, User, BATCH_ID_UNKNOWN};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruParams, LruResults};
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::{
    is_primary_lease_lost, Persistence, PersistenceTransaction, TransactionMode,
};
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::{self, TargetCache};
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    Document, DocumentKey, MaybeDocument, Mutation, MutationBatch, MutationBatchResult,
    SnapshotVersion, Timestamp,
};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::util::assert::hard_assert;

/// A resume token older than this is written even if nothing else changed.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

/// Local view of documents keyed by document key; `None` means the key has
/// no local state at all.
pub type DocumentMap = BTreeMap<DocumentKey, Option<MaybeDocument>>;

/// Documents that entered or left a view, reported after each snapshot so
/// the garbage collector keeps them while they are visible.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

impl LocalViewChanges {
    pub fn from_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> Self {
        let mut changes = Self {
            target_id,
            from_cache: snapshot.from_cache,
            ..Self::default()
        };
        for change in &snapshot.doc_changes {
            match change.change_type {
                ChangeType::Added => {
                    changes.added_keys.insert(change.doc.key().clone());
                }
                ChangeType::Removed => {
                    changes.removed_keys.insert(change.doc.key().clone());
                }
                ChangeType::Modified | ChangeType::Metadata => {}
            }
        }
        changes
    }
}

#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: BTreeMap<DocumentKey, Document>,
    /// Keys the backend last reported for the query's target.
    pub remote_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: DocumentMap,
}

#[derive(Clone, Debug, Default)]
pub struct UserChangeResult {
    /// Batches of the previous user that no longer apply.
    pub removed_batch_ids: Vec<BatchId>,
    /// Batches of the new user found in storage.
    pub added_batch_ids: Vec<BatchId>,
    pub affected_documents: DocumentMap,
}

struct LocalStoreState {
    user: User,
    mutation_queue: MutationQueue,
    local_documents: LocalDocumentsView,
    /// Targets this client currently listens to.
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    local_view_references: ReferenceSet,
    /// Keys of batches written by this client, so acknowledgements do not
    /// need to read the batch back.
    document_keys_by_batch_id: BTreeMap<BatchId, BTreeSet<DocumentKey>>,
    last_document_change_read_time: SnapshotVersion,
}

pub struct LocalStore {
    persistence: Arc<Persistence>,
    query_engine: QueryEngine,
    remote_documents: RemoteDocumentCache,
    target_cache: TargetCache,
    garbage_collector: LruGarbageCollector,
    state: StdMutex<LocalStoreState>,
}

impl LocalStore {
    pub fn new(persistence: Arc<Persistence>, initial_user: &User, lru_params: LruParams) -> Arc<Self> {
        let remote_documents = RemoteDocumentCache::new();
        let mutation_queue = MutationQueue::new(initial_user.storage_key());
        Arc::new(Self {
            persistence,
            query_engine: QueryEngine::new(),
            remote_documents,
            target_cache: TargetCache::new(),
            garbage_collector: LruGarbageCollector::new(lru_params),
            state: StdMutex::new(LocalStoreState {
                user: initial_user.clone(),
                local_documents: LocalDocumentsView::new(remote_documents, mutation_queue.clone()),
                mutation_queue,
                target_data_by_target: BTreeMap::new(),
                local_view_references: ReferenceSet::new(),
                document_keys_by_batch_id: BTreeMap::new(),
                last_document_change_read_time: SnapshotVersion::min(),
            }),
        })
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    pub fn lru_params(&self) -> &LruParams {
        self.garbage_collector.params()
    }

    pub fn current_user(&self) -> User {
        self.state.lock().unwrap().user.clone()
    }

    pub async fn start(&self) -> FirestoreResult<()> {
        self.synchronize_last_document_change_read_time().await
    }

    fn queue_and_view(&self) -> (MutationQueue, LocalDocumentsView) {
        let state = self.state.lock().unwrap();
        (state.mutation_queue.clone(), state.local_documents.clone())
    }

    /// Switches to `user`'s mutation queue and returns the documents whose
    /// local view may have changed as a result.
    pub async fn handle_user_change(&self, user: &User) -> FirestoreResult<UserChangeResult> {
        let old_queue = self.state.lock().unwrap().mutation_queue.clone();
        let new_queue = MutationQueue::new(user.storage_key());
        let new_view = LocalDocumentsView::new(self.remote_documents, new_queue.clone());

        let result = self
            .persistence
            .run_transaction("Handle user change", TransactionMode::ReadOnly, |txn| {
                let old_batches = old_queue.get_all_mutation_batches(txn)?;
                let new_batches = new_queue.get_all_mutation_batches(txn)?;
                let changed_keys: BTreeSet<DocumentKey> = old_batches
                    .iter()
                    .chain(&new_batches)
                    .flat_map(MutationBatch::keys)
                    .collect();
                Ok(UserChangeResult {
                    removed_batch_ids: old_batches.iter().map(|b| b.batch_id).collect(),
                    added_batch_ids: new_batches.iter().map(|b| b.batch_id).collect(),
                    affected_documents: new_view.get_documents(txn, &changed_keys)?,
                })
            })
            .await?;

        let mut state = self.state.lock().unwrap();
        state.user = user.clone();
        state.mutation_queue = new_queue;
        state.local_documents = new_view;
        state.document_keys_by_batch_id.clear();
        Ok(result)
    }

    /// Queues `mutations` as one batch and returns the batch id with the
    /// resulting local view of every touched document.
    pub async fn write_locally(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|m| m.key().clone()).collect();
        let (queue, view) = self.queue_and_view();

        let (batch, changes) = self
            .persistence
            .run_transaction("Locally write mutations", TransactionMode::ReadWrite, |txn| {
                let mut documents = view.get_documents(txn, &keys)?;
                // Non-idempotent transforms need the value they started from,
                // so it is recorded as a patch applied ahead of the batch.
                let base_mutations: Vec<Mutation> = mutations
                    .iter()
                    .filter_map(|mutation| {
                        let existing = documents.get(mutation.key()).and_then(Option::as_ref);
                        let base_value = mutation.extract_base_value(existing)?;
                        let mask = base_value.field_mask();
                        Some(Mutation::patch(mutation.key().clone(), base_value, mask))
                    })
                    .collect();
                let batch =
                    queue.add_mutation_batch(txn, local_write_time, base_mutations, mutations.clone())?;
                batch.apply_to_local_document_set(&mut documents);
                Ok((batch, documents))
            })
            .await?;

        self.state
            .lock()
            .unwrap()
            .document_keys_by_batch_id
            .insert(batch.batch_id, batch.keys());
        Ok(LocalWriteResult {
            batch_id: batch.batch_id,
            changes,
        })
    }

    /// Applies an acknowledged batch to the remote document cache and drops
    /// it from the queue.
    pub async fn acknowledge_batch(&self, result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        let (queue, view) = self.queue_and_view();
        let affected = self
            .persistence
            .run_transaction("Acknowledge batch", TransactionMode::ReadWritePrimary, |txn| {
                queue.acknowledge_batch(txn, &result.batch, &result.stream_token)?;
                self.apply_write_to_remote_documents(txn, &queue, result)?;
                queue.perform_consistency_check(txn)?;
                view.get_documents(txn, &result.batch.keys())
            })
            .await?;
        self.remove_cached_mutation_batch_metadata(result.batch.batch_id);
        Ok(affected)
    }

    fn apply_write_to_remote_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        queue: &MutationQueue,
        result: &MutationBatchResult,
    ) -> FirestoreResult<()> {
        let batch = &result.batch;
        for key in batch.keys() {
            let remote_doc = self.remote_documents.get_entry(txn, &key)?;
            let Some(ack_version) = result.doc_versions.get(&key).copied() else {
                return Err(internal_error(format!(
                    "Acknowledged batch {} has no version for {key}",
                    batch.batch_id
                )));
            };
            let outdated = remote_doc
                .as_ref()
                .map_or(true, |doc| doc.version() < ack_version);
            if !outdated {
                continue;
            }
            if let Some(doc) = batch.apply_to_remote_document(&key, remote_doc, result) {
                self.remote_documents.add_entry(txn, &doc, result.commit_version)?;
            }
        }
        queue.remove_mutation_batch(txn, batch)
    }

    /// Drops a batch the backend rejected and returns the documents whose
    /// local view reverted.
    pub async fn reject_batch(&self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        let (queue, view) = self.queue_and_view();
        let affected = self
            .persistence
            .run_transaction("Reject batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = queue
                    .lookup_mutation_batch(txn, batch_id)?
                    .ok_or_else(|| internal_error(format!("Attempt to reject nonexistent batch {batch_id}")))?;
                queue.remove_mutation_batch(txn, &batch)?;
                queue.perform_consistency_check(txn)?;
                view.get_documents(txn, &batch.keys())
            })
            .await?;
        self.remove_cached_mutation_batch_metadata(batch_id);
        Ok(affected)
    }

    pub async fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let (queue, _) = self.queue_and_view();
        self.persistence
            .run_transaction(
                "Get highest unacknowledged batch id",
                TransactionMode::ReadOnly,
                |txn| queue.get_highest_unacknowledged_batch_id(txn),
            )
            .await
    }

    pub async fn get_last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        let (queue, _) = self.queue_and_view();
        self.persistence
            .run_transaction("Get last stream token", TransactionMode::ReadOnly, |txn| {
                queue.get_last_stream_token(txn)
            })
            .await
    }

    pub async fn set_last_stream_token(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        let (queue, _) = self.queue_and_view();
        self.persistence
            .run_transaction("Set last stream token", TransactionMode::ReadWritePrimary, |txn| {
                queue.set_last_stream_token(txn, &stream_token)
            })
            .await
    }

    /// The first batch with an id greater than `after_batch_id`, or the first
    /// batch of the queue.
    pub async fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        let (queue, _) = self.queue_and_view();
        let after = after_batch_id.unwrap_or(BATCH_ID_UNKNOWN);
        self.persistence
            .run_transaction("Get next mutation batch", TransactionMode::ReadOnly, |txn| {
                queue.get_next_mutation_batch_after_batch_id(txn, after)
            })
            .await
    }

    /// Local view of the documents a batch touches, or `None` if the batch is
    /// gone.
    pub async fn lookup_mutation_documents(&self, batch_id: BatchId) -> FirestoreResult<Option<DocumentMap>> {
        let cached_keys = self
            .state
            .lock()
            .unwrap()
            .document_keys_by_batch_id
            .get(&batch_id)
            .cloned();
        let (queue, view) = self.queue_and_view();
        self.persistence
            .run_transaction("Lookup mutation documents", TransactionMode::ReadOnly, |txn| {
                let keys = match &cached_keys {
                    Some(keys) => Some(keys.clone()),
                    None => queue.lookup_mutation_keys(txn, batch_id)?,
                };
                keys.map(|keys| view.get_documents(txn, &keys)).transpose()
            })
            .await
    }

    pub fn remove_cached_mutation_batch_metadata(&self, batch_id: BatchId) {
        self.state
            .lock()
            .unwrap()
            .document_keys_by_batch_id
            .remove(&batch_id);
    }

    pub async fn get_last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.persistence
            .run_transaction("Get last remote snapshot version", TransactionMode::ReadOnly, |txn| {
                self.target_cache.get_last_remote_snapshot_version(txn)
            })
            .await
    }

    /// Applies a watch snapshot: target membership, resume tokens and
    /// document updates. Returns the local view of every changed document.
    pub async fn apply_remote_event(&self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let remote_version = event.snapshot_version;
        let (active_targets, view) = {
            let state = self.state.lock().unwrap();
            (state.target_data_by_target.clone(), state.local_documents.clone())
        };

        let (changed_docs, updated_targets) = self
            .persistence
            .run_transaction("Apply remote event", TransactionMode::ReadWritePrimary, |txn| {
                let mut updated_targets = BTreeMap::new();
                for (target_id, change) in &event.target_changes {
                    let Some(old_target_data) = active_targets.get(target_id) else {
                        continue;
                    };
                    self.target_cache
                        .remove_matching_keys(txn, &change.removed_documents, *target_id)?;
                    self.target_cache
                        .add_matching_keys(txn, &change.added_documents, *target_id)?;

                    if change.resume_token.is_empty() {
                        continue;
                    }
                    let sequence_number = txn.current_sequence_number()?;
                    let new_target_data = old_target_data
                        .with_resume_token(change.resume_token.clone(), remote_version)
                        .with_sequence_number(sequence_number);
                    if should_persist_target_data(old_target_data, &new_target_data, change) {
                        self.target_cache.update_target_data(txn, &new_target_data)?;
                    }
                    updated_targets.insert(*target_id, new_target_data);
                }

                let existing_docs = self
                    .remote_documents
                    .get_entries(txn, event.document_updates.keys())?;
                let mut changed_docs = DocumentMap::new();
                for (key, doc) in &event.document_updates {
                    let existing = existing_docs.get(key).and_then(Option::as_ref);
                    if doc.is_no_document() && doc.version().is_min() {
                        // Deletes manufactured by the client carry no version
                        // and always win.
                        self.remote_documents.remove_entry(txn, key)?;
                        changed_docs.insert(key.clone(), Some(doc.clone()));
                    } else if is_newer(doc, existing) {
                        hard_assert(
                            !remote_version.is_min(),
                            "Cannot add a document when the remote version is zero",
                        );
                        self.remote_documents.add_entry(txn, doc, remote_version)?;
                        changed_docs.insert(key.clone(), Some(doc.clone()));
                    } else if let Some(existing) = existing {
                        log::debug!(
                            "Ignoring outdated watch update for {key}. Current version: {}, watch version: {}",
                            existing.version(),
                            doc.version()
                        );
                    }
                    if event.resolved_limbo_documents.contains(key) {
                        target_cache::update_sentinel(txn, key)?;
                    }
                }

                if !remote_version.is_min() {
                    let last_remote_version = self.target_cache.get_last_remote_snapshot_version(txn)?;
                    if remote_version < last_remote_version {
                        return Err(internal_error(format!(
                            "Watch stream reverted to previous snapshot: {remote_version} < {last_remote_version}"
                        )));
                    }
                    self.target_cache
                        .set_last_remote_snapshot_version(txn, remote_version)?;
                }

                let local_view = view.get_local_view_of_documents(txn, changed_docs)?;
                Ok((local_view, updated_targets))
            })
            .await?;

        self.state
            .lock()
            .unwrap()
            .target_data_by_target
            .extend(updated_targets);
        Ok(changed_docs)
    }

    /// Records which documents became visible or invisible in views.
    pub async fn notify_local_view_changes(&self, view_changes: Vec<LocalViewChanges>) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Notify local view changes", TransactionMode::ReadWrite, |txn| {
                for change in &view_changes {
                    for key in change.added_keys.iter().chain(&change.removed_keys) {
                        target_cache::update_sentinel(txn, key)?;
                    }
                }
                Ok(())
            })
            .await?;

        let mut state = self.state.lock().unwrap();
        for change in view_changes {
            state
                .local_view_references
                .add_references(&change.added_keys, change.target_id);
            state
                .local_view_references
                .remove_references(&change.removed_keys, change.target_id);

            if !change.from_cache {
                if let Some(target_data) = state.target_data_by_target.get(&change.target_id) {
                    // The view is consistent with the backend, so everything up
                    // to its snapshot version is free of limbo documents.
                    let updated = target_data
                        .with_last_limbo_free_snapshot_version(target_data.snapshot_version);
                    state
                        .target_data_by_target
                        .insert(change.target_id, updated);
                }
            }
        }
        Ok(())
    }

    pub async fn read_document(&self, key: &DocumentKey) -> FirestoreResult<Option<MaybeDocument>> {
        let (_, view) = self.queue_and_view();
        self.persistence
            .run_transaction("Read document", TransactionMode::ReadOnly, |txn| {
                view.get_document(txn, key)
            })
            .await
    }

    /// Returns the persisted target data for `target`, creating it with a new
    /// target id if it was never listened to before.
    pub async fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let target_data = self
            .persistence
            .run_transaction("Allocate target", TransactionMode::ReadWrite, |txn| {
                if let Some(cached) = self.target_cache.get_target_data(txn, &target)? {
                    return Ok(cached);
                }
                let target_id = self.target_cache.allocate_target_id(txn)?;
                let sequence_number = txn.current_sequence_number()?;
                let target_data =
                    TargetData::new(target.clone(), target_id, TargetPurpose::Listen, sequence_number);
                self.target_cache.add_target_data(txn, &target_data)?;
                Ok(target_data)
            })
            .await?;

        let mut state = self.state.lock().unwrap();
        let newer = state
            .target_data_by_target
            .get(&target_data.target_id)
            .map_or(true, |existing| target_data.snapshot_version > existing.snapshot_version);
        if newer {
            state
                .target_data_by_target
                .insert(target_data.target_id, target_data.clone());
        }
        Ok(target_data)
    }

    pub async fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        if let Some(active) = self.active_target_data(target) {
            return Ok(Some(active));
        }
        self.persistence
            .run_transaction("Get target data", TransactionMode::ReadOnly, |txn| {
                self.target_cache.get_target_data(txn, target)
            })
            .await
    }

    fn active_target_data(&self, target: &Target) -> Option<TargetData> {
        self.state
            .lock()
            .unwrap()
            .target_data_by_target
            .values()
            .find(|data| &data.target == target)
            .cloned()
    }

    /// Target data by id, preferring the in-memory copy of active targets.
    pub async fn get_cached_target(&self, target_id: TargetId) -> FirestoreResult<Option<TargetData>> {
        let active = self
            .state
            .lock()
            .unwrap()
            .target_data_by_target
            .get(&target_id)
            .cloned();
        if active.is_some() {
            return Ok(active);
        }
        self.persistence
            .run_transaction("Get cached target", TransactionMode::ReadOnly, |txn| {
                self.target_cache.get_target_data_for_id(txn, target_id)
            })
            .await
    }

    /// Stops tracking a target. With `keep_persisted_target_data` the stored
    /// target is left untouched for other clients still listening to it.
    pub async fn release_target(&self, target_id: TargetId, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let (target_data, removed_references) = {
            let mut state = self.state.lock().unwrap();
            let Some(target_data) = state.target_data_by_target.get(&target_id).cloned() else {
                return Err(internal_error(format!(
                    "Tried to release nonexistent target: {target_id}"
                )));
            };
            let removed = state
                .local_view_references
                .remove_references_for_id(target_id);
            (target_data, removed)
        };

        if !keep_persisted_target_data {
            let outcome = self
                .persistence
                .run_transaction("Release target", TransactionMode::ReadWritePrimary, |txn| {
                    for key in &removed_references {
                        target_cache::update_sentinel(txn, key)?;
                    }
                    let sequence_number = txn.current_sequence_number()?;
                    self.target_cache
                        .update_target_data(txn, &target_data.with_sequence_number(sequence_number))
                })
                .await;
            match outcome {
                Ok(()) => {}
                Err(err) if err.is_storage_transaction() || is_primary_lease_lost(&err) => {
                    log::debug!("Failed to update sequence numbers for target {target_id}: {err}");
                }
                Err(err) => return Err(err),
            }
        }

        self.state
            .lock()
            .unwrap()
            .target_data_by_target
            .remove(&target_id);
        Ok(())
    }

    /// Runs `query` against the local cache. With `use_previous_results` the
    /// last limbo-free result of the query's target seeds the computation.
    pub async fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let target = query.to_target();
        let active = self.active_target_data(&target);
        let (_, view) = self.queue_and_view();
        self.persistence
            .run_transaction("Execute query", TransactionMode::ReadOnly, |txn| {
                let target_data = match &active {
                    Some(data) => Some(data.clone()),
                    None => self.target_cache.get_target_data(txn, &target)?,
                };
                let (last_limbo_free, remote_keys) = match &target_data {
                    Some(data) => (
                        data.last_limbo_free_snapshot_version,
                        self.target_cache
                            .get_matching_keys_for_target(txn, data.target_id)?,
                    ),
                    None => (SnapshotVersion::min(), BTreeSet::new()),
                };
                let documents = if use_previous_results {
                    self.query_engine
                        .get_documents_matching_query(txn, &view, query, last_limbo_free, &remote_keys)?
                } else {
                    self.query_engine.get_documents_matching_query(
                        txn,
                        &view,
                        query,
                        SnapshotVersion::min(),
                        &BTreeSet::new(),
                    )?
                };
                Ok(QueryResult {
                    documents,
                    remote_keys,
                })
            })
            .await
    }

    pub async fn remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        self.persistence
            .run_transaction("Remote document keys", TransactionMode::ReadOnly, |txn| {
                self.target_cache.get_matching_keys_for_target(txn, target_id)
            })
            .await
    }

    /// Documents written to the remote cache since the last call, with
    /// pending writes applied. Secondary clients use this to follow the
    /// primary.
    pub async fn get_new_document_changes(&self) -> FirestoreResult<DocumentMap> {
        let since = self.state.lock().unwrap().last_document_change_read_time;
        let (_, view) = self.queue_and_view();
        let (changes, read_time) = self
            .persistence
            .run_transaction("Get new document changes", TransactionMode::ReadOnly, |txn| {
                let (changes, read_time) = self.remote_documents.get_new_document_changes(txn, since)?;
                let changes: DocumentMap = changes
                    .into_iter()
                    .map(|(key, doc)| (key, Some(doc)))
                    .collect();
                Ok((view.get_local_view_of_documents(txn, changes)?, read_time))
            })
            .await?;
        let mut state = self.state.lock().unwrap();
        if read_time > state.last_document_change_read_time {
            state.last_document_change_read_time = read_time;
        }
        Ok(changes)
    }

    /// Skips every remote document change that happened before now.
    pub async fn synchronize_last_document_change_read_time(&self) -> FirestoreResult<()> {
        let read_time = self
            .persistence
            .run_transaction("Synchronize last document change read time", TransactionMode::ReadOnly, |txn| {
                self.remote_documents.get_last_read_time(txn)
            })
            .await?;
        self.state.lock().unwrap().last_document_change_read_time = read_time;
        Ok(())
    }

    pub async fn set_network_enabled(&self, enabled: bool) -> FirestoreResult<()> {
        self.persistence.set_network_enabled(enabled).await
    }

    /// Runs one LRU collection. Active targets and documents visible in a
    /// view are never collected.
    pub async fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        let (active_target_ids, pinned) = {
            let state = self.state.lock().unwrap();
            (
                state.target_data_by_target.keys().copied().collect::<BTreeSet<_>>(),
                state.local_view_references.keys(),
            )
        };
        self.persistence
            .run_transaction("Collect garbage", TransactionMode::ReadWritePrimary, |txn| {
                self.garbage_collector.collect(txn, &active_target_ids, &pinned)
            })
            .await
    }
}

fn is_newer(doc: &MaybeDocument, existing: Option<&MaybeDocument>) -> bool {
    match existing {
        None => true,
        Some(existing) => {
            doc.version() > existing.version()
                || (doc.version() == existing.version() && existing.has_pending_writes())
        }
    }
}

/// Resume tokens change on every snapshot; writing them each time would be
/// costly, so they are written only when the change matters on restart.
fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    hard_assert(
        !new.resume_token.is_empty(),
        "Attempted to persist target data with no resume token",
    );
    if old.resume_token.is_empty() {
        return true;
    }
    let elapsed = new.snapshot_version.to_micros() - old.snapshot_version.to_micros();
    if elapsed >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    let changes = change.added_documents.len()
        + change.modified_documents.len()
        + change.removed_documents.len();
    changes > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::view_snapshot::DocumentViewChange;
    use crate::firestore::local::kv_store::MemoryKvStore;
    use crate::firestore::local::persistence::PersistenceSettings;
    use crate::firestore::model::{
        DocumentSet, DocumentState, FieldPath, MutationResult, NoDocument, ResourcePath,
    };
    use crate::firestore::util::AsyncQueue;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(value: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(
            &FieldPath::from_dot_separated("x").unwrap(),
            FirestoreValue::from_integer(value),
        );
        map
    }

    fn remote_doc(path: &str, version: i64, value: i64) -> MaybeDocument {
        Document::new(
            key(path),
            SnapshotVersion::from_seconds(version),
            data(value),
            DocumentState::Synced,
        )
        .into()
    }

    async fn new_store(params: LruParams) -> Arc<LocalStore> {
        let persistence = Persistence::new(
            Arc::new(MemoryKvStore::new()),
            PersistenceSettings::new("client"),
            AsyncQueue::new(),
        );
        persistence.start().await.unwrap();
        let store = LocalStore::new(persistence, &User::unauthenticated(), params);
        store.start().await.unwrap();
        store
    }

    fn listen_event(
        target_id: TargetId,
        version: i64,
        docs: Vec<MaybeDocument>,
    ) -> RemoteEvent {
        let mut change = TargetChange {
            resume_token: format!("token-{version}").into_bytes(),
            current: true,
            ..Default::default()
        };
        let mut event = RemoteEvent {
            snapshot_version: SnapshotVersion::from_seconds(version),
            ..Default::default()
        };
        for doc in docs {
            change.added_documents.insert(doc.key().clone());
            event.document_updates.insert(doc.key().clone(), doc);
        }
        event.target_changes.insert(target_id, change);
        event
    }

    #[tokio::test]
    async fn local_write_then_acknowledgement() {
        let store = new_store(LruParams::disabled()).await;
        let write = store
            .write_locally(vec![Mutation::set(key("rooms/a"), data(1))])
            .await
            .unwrap();
        let local = write.changes[&key("rooms/a")].clone().unwrap();
        assert!(local.has_pending_writes());
        assert_eq!(local.version(), SnapshotVersion::min());

        let batch = store.next_mutation_batch(None).await.unwrap().unwrap();
        assert_eq!(batch.batch_id, write.batch_id);
        let result = MutationBatchResult::from_results(
            batch,
            SnapshotVersion::from_seconds(5),
            vec![MutationResult::new(SnapshotVersion::from_seconds(5), None)],
            b"stream".to_vec(),
        )
        .unwrap();
        store.acknowledge_batch(&result).await.unwrap();

        let doc = store.read_document(&key("rooms/a")).await.unwrap().unwrap();
        let doc = doc.as_document().unwrap();
        assert_eq!(doc.version(), SnapshotVersion::from_seconds(5));
        assert!(doc.has_committed_mutations());
        assert!(store.next_mutation_batch(None).await.unwrap().is_none());
        assert_eq!(store.get_last_stream_token().await.unwrap(), b"stream".to_vec());
        assert_eq!(
            store.get_highest_unacknowledged_batch_id().await.unwrap(),
            BATCH_ID_UNKNOWN
        );
    }

    #[tokio::test]
    async fn rejected_batch_reverts_local_view() {
        let store = new_store(LruParams::disabled()).await;
        let write = store
            .write_locally(vec![Mutation::set(key("rooms/a"), data(1))])
            .await
            .unwrap();
        let reverted = store.reject_batch(write.batch_id).await.unwrap();
        assert_eq!(reverted[&key("rooms/a")], None);
        assert!(store.lookup_mutation_documents(write.batch_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remote_event_ignores_outdated_updates() {
        let store = new_store(LruParams::disabled()).await;
        let query = Query::at_path(ResourcePath::from_string("rooms").unwrap());
        let target = store.allocate_target(query.to_target()).await.unwrap();

        store
            .apply_remote_event(&listen_event(target.target_id, 3, vec![remote_doc("rooms/a", 3, 1)]))
            .await
            .unwrap();
        let changed = store
            .apply_remote_event(&listen_event(target.target_id, 4, vec![remote_doc("rooms/a", 2, 9)]))
            .await
            .unwrap();
        assert!(changed.is_empty());

        let doc = store.read_document(&key("rooms/a")).await.unwrap().unwrap();
        assert_eq!(doc.version(), SnapshotVersion::from_seconds(3));
        assert_eq!(
            store.get_last_remote_snapshot_version().await.unwrap(),
            SnapshotVersion::from_seconds(4)
        );
        assert_eq!(
            store.remote_document_keys(target.target_id).await.unwrap(),
            BTreeSet::from([key("rooms/a")])
        );
    }

    #[tokio::test]
    async fn manufactured_delete_removes_cached_document() {
        let store = new_store(LruParams::disabled()).await;
        let query = Query::at_path(ResourcePath::from_string("rooms").unwrap());
        let target = store.allocate_target(query.to_target()).await.unwrap();
        store
            .apply_remote_event(&listen_event(target.target_id, 3, vec![remote_doc("rooms/a", 3, 1)]))
            .await
            .unwrap();

        let mut event = RemoteEvent::default();
        event.document_updates.insert(
            key("rooms/a"),
            NoDocument::new(key("rooms/a"), SnapshotVersion::min(), false).into(),
        );
        store.apply_remote_event(&event).await.unwrap();
        assert!(store.read_document(&key("rooms/a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn execute_query_overlays_pending_writes() {
        let store = new_store(LruParams::disabled()).await;
        let query = Query::at_path(ResourcePath::from_string("rooms").unwrap());
        let target = store.allocate_target(query.to_target()).await.unwrap();
        store
            .apply_remote_event(&listen_event(target.target_id, 3, vec![remote_doc("rooms/a", 3, 1)]))
            .await
            .unwrap();
        store
            .write_locally(vec![Mutation::set(key("rooms/b"), data(2))])
            .await
            .unwrap();

        let result = store.execute_query(&query, true).await.unwrap();
        assert_eq!(
            result.documents.keys().cloned().collect::<Vec<_>>(),
            vec![key("rooms/a"), key("rooms/b")]
        );
        assert_eq!(result.remote_keys, BTreeSet::from([key("rooms/a")]));
    }

    #[tokio::test]
    async fn garbage_collection_keeps_viewed_documents() {
        let params = LruParams {
            cache_size_collection_threshold: 0,
            percentile_to_collect: 100,
            ..LruParams::default()
        };
        let store = new_store(params).await;
        let rooms = Query::at_path(ResourcePath::from_string("rooms").unwrap());
        let users = Query::at_path(ResourcePath::from_string("users").unwrap());
        let rooms_target = store.allocate_target(rooms.to_target()).await.unwrap();
        let users_target = store.allocate_target(users.to_target()).await.unwrap();
        store
            .apply_remote_event(&listen_event(rooms_target.target_id, 2, vec![remote_doc("rooms/a", 2, 1)]))
            .await
            .unwrap();
        store
            .apply_remote_event(&listen_event(users_target.target_id, 3, vec![remote_doc("users/u", 3, 1)]))
            .await
            .unwrap();

        let viewed = Document::new(
            key("rooms/a"),
            SnapshotVersion::from_seconds(2),
            data(1),
            DocumentState::Synced,
        );
        let mut snapshot = ViewSnapshot::from_initial_documents(
            rooms.clone(),
            DocumentSet::key_ordered(),
            BTreeSet::new(),
            false,
        );
        snapshot.doc_changes = vec![DocumentViewChange::new(ChangeType::Added, viewed)];
        store
            .notify_local_view_changes(vec![LocalViewChanges::from_snapshot(rooms_target.target_id, &snapshot)])
            .await
            .unwrap();

        store.release_target(users_target.target_id, false).await.unwrap();
        let results = store.collect_garbage().await.unwrap();
        assert!(results.did_run);
        assert_eq!(results.targets_removed, 1);
        assert!(store.read_document(&key("users/u")).await.unwrap().is_none());
        assert!(store.read_document(&key("rooms/a")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn user_change_switches_queues() {
        let store = new_store(LruParams::disabled()).await;
        let write = store
            .write_locally(vec![Mutation::set(key("rooms/a"), data(1))])
            .await
            .unwrap();
        let result = store.handle_user_change(&User::new("alice")).await.unwrap();
        assert_eq!(result.removed_batch_ids, vec![write.batch_id]);
        assert!(result.added_batch_ids.is_empty());
        assert_eq!(result.affected_documents[&key("rooms/a")], None);
        assert_eq!(store.current_user(), User::new("alice"));
    }
}
