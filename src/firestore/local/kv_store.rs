//! Ordered, transactional key-value storage the persistence layer runs on.
//!
//! Keys and values are opaque byte strings; the caller owns the encoding of
//! composite keys (see [`super::encoded_key`]).

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::firestore::error::{storage_transaction, FirestoreResult};

/// Logical tables of the local store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    SchemaVersion,
    /// Primary lease record.
    Owner,
    ClientMetadata,
    /// Per-user queue metadata (last acknowledged batch, stream token).
    MutationQueues,
    /// Batch id allocation counter.
    MutationGlobal,
    /// Batches keyed by batch id.
    Mutations,
    /// `(user, batch id)` uniqueness index.
    MutationsByUser,
    /// `(user, document path, batch id)` index.
    DocumentMutations,
    /// Cached documents keyed by path.
    RemoteDocuments,
    /// `(read time, path)` index.
    RemoteDocumentsByReadTime,
    /// `(collection path, read time, path)` index.
    RemoteDocumentsByCollectionReadTime,
    RemoteDocumentGlobal,
    /// Target metadata keyed by target id.
    Targets,
    /// `(canonical id, target id)` index.
    TargetsByCanonicalId,
    /// `(target id, path)` associations; target id 0 holds GC sentinel rows.
    TargetDocuments,
    /// `(path, target id)` reverse index.
    DocumentTargets,
    TargetGlobal,
}

/// Range of keys for [`KvTransaction::scan`].
#[derive(Clone, Debug)]
pub struct KeyRange {
    pub start: Bound<Vec<u8>>,
    pub end: Bound<Vec<u8>>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl KeyRange {
    pub fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
            reverse: false,
            limit: None,
        }
    }

    /// Every key starting with `prefix`.
    pub fn prefix(prefix: Vec<u8>) -> Self {
        let end = match prefix_successor(&prefix) {
            Some(successor) => Bound::Excluded(successor),
            None => Bound::Unbounded,
        };
        Self {
            start: Bound::Included(prefix),
            end,
            reverse: false,
            limit: None,
        }
    }

    pub fn between(start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Self {
        Self {
            start,
            end,
            reverse: false,
            limit: None,
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Smallest key greater than every key that starts with `prefix`.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut successor = prefix.to_vec();
    while let Some(last) = successor.pop() {
        if last < u8::MAX {
            successor.push(last + 1);
            return Some(successor);
        }
    }
    None
}

/// One storage transaction. Nothing is visible to other transactions until
/// [`commit`](KvTransaction::commit) succeeds; dropping without committing
/// discards every write.
pub trait KvTransaction {
    fn get(&mut self, table: Table, key: &[u8]) -> FirestoreResult<Option<Vec<u8>>>;

    fn put(&mut self, table: Table, key: Vec<u8>, value: Vec<u8>) -> FirestoreResult<()>;

    fn delete(&mut self, table: Table, key: &[u8]) -> FirestoreResult<()>;

    fn scan(&mut self, table: Table, range: KeyRange) -> FirestoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    fn commit(self: Box<Self>) -> FirestoreResult<()>;
}

/// A store that several clients of the same process may share.
pub trait KvStore: Send + Sync + 'static {
    fn begin(&self) -> FirestoreResult<Box<dyn KvTransaction + '_>>;
}

type TableData = BTreeMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>;

#[derive(Default)]
struct MemoryState {
    tables: TableData,
    failing_begins: usize,
    failing_commits: usize,
}

/// In-process store. Transactions are serialized by a lock held for the
/// transaction's lifetime and roll back through an undo log.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` transactions fail to start with a storage
    /// transaction error.
    pub fn fail_next_transactions(&self, count: usize) {
        self.state.lock().unwrap().failing_begins = count;
    }

    /// Makes the next `count` commits fail and roll back.
    pub fn fail_next_commits(&self, count: usize) {
        self.state.lock().unwrap().failing_commits = count;
    }

    /// Number of rows in `table`.
    pub fn row_count(&self, table: Table) -> usize {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(&table)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

impl KvStore for MemoryKvStore {
    fn begin(&self) -> FirestoreResult<Box<dyn KvTransaction + '_>> {
        let mut guard = self.state.lock().unwrap();
        if guard.failing_begins > 0 {
            guard.failing_begins -= 1;
            return Err(storage_transaction("Injected failure starting transaction"));
        }
        Ok(Box::new(MemoryTransaction {
            guard,
            undo: Vec::new(),
            done: false,
        }))
    }
}

struct MemoryTransaction<'a> {
    guard: MutexGuard<'a, MemoryState>,
    /// Previous value of every key written, in write order.
    undo: Vec<(Table, Vec<u8>, Option<Vec<u8>>)>,
    done: bool,
}

impl MemoryTransaction<'_> {
    fn rollback(&mut self) {
        while let Some((table, key, previous)) = self.undo.pop() {
            let rows = self.guard.tables.entry(table).or_default();
            match previous {
                Some(value) => {
                    rows.insert(key, value);
                }
                None => {
                    rows.remove(&key);
                }
            }
        }
    }
}

impl KvTransaction for MemoryTransaction<'_> {
    fn get(&mut self, table: Table, key: &[u8]) -> FirestoreResult<Option<Vec<u8>>> {
        Ok(self
            .guard
            .tables
            .get(&table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    fn put(&mut self, table: Table, key: Vec<u8>, value: Vec<u8>) -> FirestoreResult<()> {
        let rows = self.guard.tables.entry(table).or_default();
        let previous = rows.insert(key.clone(), value);
        self.undo.push((table, key, previous));
        Ok(())
    }

    fn delete(&mut self, table: Table, key: &[u8]) -> FirestoreResult<()> {
        if let Some(rows) = self.guard.tables.get_mut(&table) {
            if let Some(previous) = rows.remove(key) {
                self.undo.push((table, key.to_vec(), Some(previous)));
            }
        }
        Ok(())
    }

    fn scan(&mut self, table: Table, range: KeyRange) -> FirestoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let Some(rows) = self.guard.tables.get(&table) else {
            return Ok(Vec::new());
        };
        let limit = range.limit.unwrap_or(usize::MAX);
        let bounds = (range.start, range.end);
        if is_empty_range(&bounds.0, &bounds.1) {
            return Ok(Vec::new());
        }
        let iter = rows.range::<Vec<u8>, _>(bounds);
        let entries = if range.reverse {
            iter.rev()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            iter.take(limit).map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        Ok(entries)
    }

    fn commit(mut self: Box<Self>) -> FirestoreResult<()> {
        self.done = true;
        if self.guard.failing_commits > 0 {
            self.guard.failing_commits -= 1;
            self.rollback();
            return Err(storage_transaction("Injected failure committing transaction"));
        }
        self.undo.clear();
        Ok(())
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.rollback();
        }
    }
}

fn is_empty_range(start: &Bound<Vec<u8>>, end: &Bound<Vec<u8>>) -> bool {
    match (start, end) {
        (Bound::Included(s), Bound::Included(e)) => s > e,
        (Bound::Included(s) | Bound::Excluded(s), Bound::Included(e) | Bound::Excluded(e)) => {
            s >= e
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(store: &MemoryKvStore, key: &[u8], value: &[u8]) {
        let mut txn = store.begin().unwrap();
        txn.put(Table::RemoteDocuments, key.to_vec(), value.to_vec())
            .unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn committed_writes_are_visible() {
        let store = MemoryKvStore::new();
        put(&store, b"a", b"1");
        let mut txn = store.begin().unwrap();
        assert_eq!(
            txn.get(Table::RemoteDocuments, b"a").unwrap(),
            Some(b"1".to_vec())
        );
        assert_eq!(txn.get(Table::Targets, b"a").unwrap(), None);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let store = MemoryKvStore::new();
        put(&store, b"a", b"1");
        {
            let mut txn = store.begin().unwrap();
            txn.put(Table::RemoteDocuments, b"a".to_vec(), b"2".to_vec())
                .unwrap();
            txn.put(Table::RemoteDocuments, b"b".to_vec(), b"3".to_vec())
                .unwrap();
            txn.delete(Table::RemoteDocuments, b"a").unwrap();
        }
        let mut txn = store.begin().unwrap();
        assert_eq!(
            txn.get(Table::RemoteDocuments, b"a").unwrap(),
            Some(b"1".to_vec())
        );
        assert_eq!(txn.get(Table::RemoteDocuments, b"b").unwrap(), None);
    }

    #[test]
    fn injected_commit_failure_is_atomic() {
        let store = MemoryKvStore::new();
        store.fail_next_commits(1);
        let mut txn = store.begin().unwrap();
        txn.put(Table::Mutations, b"1".to_vec(), b"x".to_vec())
            .unwrap();
        txn.put(Table::DocumentMutations, b"1".to_vec(), b"x".to_vec())
            .unwrap();
        let err = txn.commit().unwrap_err();
        assert!(err.is_storage_transaction());
        assert_eq!(store.row_count(Table::Mutations), 0);
        assert_eq!(store.row_count(Table::DocumentMutations), 0);
    }

    #[test]
    fn injected_begin_failure() {
        let store = MemoryKvStore::new();
        store.fail_next_transactions(1);
        assert!(store.begin().is_err());
        assert!(store.begin().is_ok());
    }

    #[test]
    fn scans_prefix_in_both_directions() {
        let store = MemoryKvStore::new();
        for key in [&b"a1"[..], b"a2", b"a3", b"b1"] {
            put(&store, key, b"");
        }
        let mut txn = store.begin().unwrap();
        let keys: Vec<Vec<u8>> = txn
            .scan(Table::RemoteDocuments, KeyRange::prefix(b"a".to_vec()))
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"a1".to_vec(), b"a2".to_vec(), b"a3".to_vec()]);

        let last = txn
            .scan(
                Table::RemoteDocuments,
                KeyRange::prefix(b"a".to_vec()).reversed().with_limit(1),
            )
            .unwrap();
        assert_eq!(last[0].0, b"a3".to_vec());
    }

    #[test]
    fn prefix_successor_skips_max_bytes() {
        assert_eq!(prefix_successor(&[1, 0xFF]), Some(vec![2]));
        assert_eq!(prefix_successor(&[0xFF]), None);
    }
}
