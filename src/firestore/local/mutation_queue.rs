//! Per-user queue of locally issued mutation batches awaiting
//! acknowledgement by the backend.

use std::collections::BTreeSet;
use std::ops::Bound;

use crate::firestore::core::query::Query;
use crate::firestore::core::types::{BatchId, BATCH_ID_UNKNOWN};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::encoded_key::{KeyDecoder, KeyEncoder};
use crate::firestore::local::kv_store::{prefix_successor, KeyRange, Table};
use crate::firestore::local::local_serializer::{self, DbMutationGlobal, DbMutationQueue};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::target_cache;
use crate::firestore::model::{DocumentKey, Mutation, MutationBatch, Timestamp};

const GLOBAL_KEY: &[u8] = b"global";

fn batch_key(batch_id: BatchId) -> Vec<u8> {
    KeyEncoder::new().i32(batch_id).finish()
}

/// True if any user's queue has a pending write for `key`.
pub(crate) fn any_queue_contains_key(
    txn: &mut PersistenceTransaction<'_>,
    key: &DocumentKey,
) -> FirestoreResult<bool> {
    for (row_key, _) in txn.scan(Table::DocumentMutations, KeyRange::all())? {
        let mut decoder = KeyDecoder::new(&row_key);
        decoder.string()?;
        if &decoder.document_key()? == key {
            return Ok(true);
        }
    }
    Ok(false)
}

#[derive(Clone, Debug)]
pub struct MutationQueue {
    user_id: String,
}

impl MutationQueue {
    /// `user_id` is empty for the unauthenticated user.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn user_batch_key(&self, batch_id: BatchId) -> Vec<u8> {
        KeyEncoder::new().string(&self.user_id).i32(batch_id).finish()
    }

    fn user_prefix(&self) -> Vec<u8> {
        KeyEncoder::new().string(&self.user_id).finish()
    }

    fn document_mutation_key(&self, key: &DocumentKey, batch_id: BatchId) -> Vec<u8> {
        KeyEncoder::new()
            .string(&self.user_id)
            .path(key.path())
            .i32(batch_id)
            .finish()
    }

    fn read_metadata(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<DbMutationQueue> {
        match txn.get(Table::MutationQueues, self.user_id.as_bytes())? {
            Some(bytes) => local_serializer::decode(&bytes),
            None => Ok(DbMutationQueue {
                user_id: self.user_id.clone(),
                last_acknowledged_batch_id: BATCH_ID_UNKNOWN,
                last_stream_token: String::new(),
            }),
        }
    }

    fn write_metadata(&self, txn: &mut PersistenceTransaction<'_>, metadata: &DbMutationQueue) -> FirestoreResult<()> {
        txn.put(
            Table::MutationQueues,
            self.user_id.as_bytes().to_vec(),
            local_serializer::encode(metadata)?,
        )
    }

    pub fn check_empty(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<bool> {
        let rows = txn.scan(
            Table::MutationsByUser,
            KeyRange::prefix(self.user_prefix()).with_limit(1),
        )?;
        Ok(rows.is_empty())
    }

    /// Appends a batch. Batch ids are allocated from a store-wide counter
    /// and never reused, even across users.
    pub fn add_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        let mut global: DbMutationGlobal = match txn.get(Table::MutationGlobal, GLOBAL_KEY)? {
            Some(bytes) => local_serializer::decode(&bytes)?,
            None => DbMutationGlobal::default(),
        };
        global.highest_batch_id += 1;
        txn.put(
            Table::MutationGlobal,
            GLOBAL_KEY.to_vec(),
            local_serializer::encode(&global)?,
        )?;

        let batch = MutationBatch::new(global.highest_batch_id, local_write_time, base_mutations, mutations);
        txn.put(
            Table::Mutations,
            batch_key(batch.batch_id),
            local_serializer::encode_mutation_batch(&self.user_id, &batch)?,
        )?;
        txn.put(Table::MutationsByUser, self.user_batch_key(batch.batch_id), Vec::new())?;
        for key in batch.keys() {
            txn.put(
                Table::DocumentMutations,
                self.document_mutation_key(&key, batch.batch_id),
                Vec::new(),
            )?;
        }
        Ok(batch)
    }

    pub fn lookup_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let Some(bytes) = txn.get(Table::Mutations, &batch_key(batch_id))? else {
            return Ok(None);
        };
        let record = local_serializer::decode_mutation_batch(&bytes)?;
        if record.user_id != self.user_id {
            return Ok(None);
        }
        Ok(Some(record.batch))
    }

    pub fn lookup_mutation_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<BTreeSet<DocumentKey>>> {
        Ok(self
            .lookup_mutation_batch(txn, batch_id)?
            .map(|batch| batch.keys()))
    }

    /// First batch with an id greater than `batch_id`.
    pub fn get_next_mutation_batch_after_batch_id(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let start = self.user_batch_key(batch_id.saturating_add(1));
        let end = prefix_successor(&self.user_prefix())
            .map(Bound::Excluded)
            .unwrap_or(Bound::Unbounded);
        let range = KeyRange::between(Bound::Included(start), end).with_limit(1);
        match txn.scan(Table::MutationsByUser, range)?.first() {
            Some((row_key, _)) => {
                let next_id = self.decode_user_batch_id(row_key)?;
                self.lookup_mutation_batch(txn, next_id)
            }
            None => Ok(None),
        }
    }

    pub fn get_highest_unacknowledged_batch_id(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<BatchId> {
        let rows = txn.scan(
            Table::MutationsByUser,
            KeyRange::prefix(self.user_prefix()).reversed().with_limit(1),
        )?;
        match rows.first() {
            Some((row_key, _)) => self.decode_user_batch_id(row_key),
            None => Ok(BATCH_ID_UNKNOWN),
        }
    }

    fn decode_user_batch_id(&self, row_key: &[u8]) -> FirestoreResult<BatchId> {
        let mut decoder = KeyDecoder::new(row_key);
        decoder.string()?;
        decoder.i32()
    }

    pub fn get_all_mutation_batches(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<Vec<MutationBatch>> {
        let ids: Vec<BatchId> = txn
            .scan(Table::MutationsByUser, KeyRange::prefix(self.user_prefix()))?
            .iter()
            .map(|(row_key, _)| self.decode_user_batch_id(row_key))
            .collect::<FirestoreResult<_>>()?;
        self.lookup_batches(txn, ids)
    }

    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        self.get_all_mutation_batches_affecting_document_keys(txn, [key])
    }

    /// Batches touching any of `keys`, in batch id order.
    pub fn get_all_mutation_batches_affecting_document_keys<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut ids = BTreeSet::new();
        for key in keys {
            let prefix = KeyEncoder::new().string(&self.user_id).path(key.path()).finish();
            for (row_key, _) in txn.scan(Table::DocumentMutations, KeyRange::prefix(prefix))? {
                let mut decoder = KeyDecoder::new(&row_key);
                decoder.string()?;
                decoder.path()?;
                ids.insert(decoder.i32()?);
            }
        }
        self.lookup_batches(txn, ids)
    }

    /// Batches that may affect the result of `query`. The batches can touch
    /// documents that do not match the query; callers filter.
    pub fn get_all_mutation_batches_affecting_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let prefix = if query.is_collection_group_query() {
            self.user_prefix()
        } else {
            KeyEncoder::new()
                .string(&self.user_id)
                .path_prefix(query.path())
                .finish()
        };
        let mut ids = BTreeSet::new();
        for (row_key, _) in txn.scan(Table::DocumentMutations, KeyRange::prefix(prefix))? {
            let mut decoder = KeyDecoder::new(&row_key);
            decoder.string()?;
            let key = decoder.document_key()?;
            let batch_id = decoder.i32()?;
            let relevant = match query.collection_group_id() {
                Some(group) => key.collection_group() == group && query.path().is_prefix_of(key.path()),
                None => {
                    query.path().is_immediate_parent_of(key.path()) || query.path() == key.path()
                }
            };
            if relevant {
                ids.insert(batch_id);
            }
        }
        self.lookup_batches(txn, ids)
    }

    fn lookup_batches(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        ids: impl IntoIterator<Item = BatchId>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut batches = Vec::new();
        for batch_id in ids {
            match self.lookup_mutation_batch(txn, batch_id)? {
                Some(batch) => batches.push(batch),
                None => {
                    return Err(internal_error(format!(
                        "Dangling document-mutation reference found: batch {batch_id} missing"
                    )))
                }
            }
        }
        Ok(batches)
    }

    /// Removes the batch and its index rows, and stamps the GC sentinel of
    /// every document it touched.
    pub fn remove_mutation_batch(&self, txn: &mut PersistenceTransaction<'_>, batch: &MutationBatch) -> FirestoreResult<()> {
        txn.delete(Table::Mutations, &batch_key(batch.batch_id))?;
        txn.delete(Table::MutationsByUser, &self.user_batch_key(batch.batch_id))?;
        for key in batch.keys() {
            txn.delete(
                Table::DocumentMutations,
                &self.document_mutation_key(&key, batch.batch_id),
            )?;
            target_cache::update_sentinel(txn, &key)?;
        }
        Ok(())
    }

    pub fn acknowledge_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch: &MutationBatch,
        stream_token: &[u8],
    ) -> FirestoreResult<()> {
        let mut metadata = self.read_metadata(txn)?;
        metadata.last_acknowledged_batch_id = batch.batch_id;
        metadata.last_stream_token = local_serializer::encode_token(stream_token);
        self.write_metadata(txn, &metadata)
    }

    pub fn get_last_stream_token(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<Vec<u8>> {
        let metadata = self.read_metadata(txn)?;
        local_serializer::decode_token(&metadata.last_stream_token)
    }

    pub fn set_last_stream_token(&self, txn: &mut PersistenceTransaction<'_>, stream_token: &[u8]) -> FirestoreResult<()> {
        let mut metadata = self.read_metadata(txn)?;
        metadata.last_stream_token = local_serializer::encode_token(stream_token);
        self.write_metadata(txn, &metadata)
    }

    /// An empty queue must not leave document-mutation rows behind.
    pub fn perform_consistency_check(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
        if !self.check_empty(txn)? {
            return Ok(());
        }
        let dangling = txn.scan(
            Table::DocumentMutations,
            KeyRange::prefix(self.user_prefix()).with_limit(1),
        )?;
        if !dangling.is_empty() {
            return Err(internal_error(
                "Document leak: mutation queue is empty but document mutations remain",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::kv_store::{KvStore, MemoryKvStore};
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::model::ResourcePath;
    use crate::firestore::value::MapValue;

    fn with_txn<T>(store: &MemoryKvStore, f: impl FnOnce(&mut PersistenceTransaction<'_>) -> T) -> T {
        let mut txn = PersistenceTransaction::new(store.begin().unwrap(), TransactionMode::ReadWrite);
        let result = f(&mut txn);
        txn.commit().unwrap();
        result
    }

    fn set(path: &str) -> Mutation {
        Mutation::set(DocumentKey::from_string(path).unwrap(), MapValue::empty())
    }

    #[test]
    fn batch_ids_are_never_reused() {
        let store = MemoryKvStore::new();
        let queue = MutationQueue::new("alice");
        with_txn(&store, |txn| {
            let first = queue
                .add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a")])
                .unwrap();
            queue.remove_mutation_batch(txn, &first).unwrap();
            let second = queue
                .add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/b")])
                .unwrap();
            assert!(second.batch_id > first.batch_id);
        });
    }

    #[test]
    fn queues_are_isolated_per_user() {
        let store = MemoryKvStore::new();
        let alice = MutationQueue::new("alice");
        let bob = MutationQueue::new("bob");
        with_txn(&store, |txn| {
            let batch = alice
                .add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a")])
                .unwrap();
            assert!(bob.check_empty(txn).unwrap());
            assert!(bob.lookup_mutation_batch(txn, batch.batch_id).unwrap().is_none());
            assert_eq!(
                alice.get_highest_unacknowledged_batch_id(txn).unwrap(),
                batch.batch_id
            );
            assert_eq!(bob.get_highest_unacknowledged_batch_id(txn).unwrap(), BATCH_ID_UNKNOWN);
        });
    }

    #[test]
    fn finds_batches_by_document_and_query() {
        let store = MemoryKvStore::new();
        let queue = MutationQueue::new("");
        with_txn(&store, |txn| {
            let a = queue
                .add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a")])
                .unwrap();
            let nested = queue
                .add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a/messages/m")])
                .unwrap();
            let b = queue
                .add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/b"), set("users/x")])
                .unwrap();

            let key = DocumentKey::from_string("rooms/a").unwrap();
            let by_key = queue
                .get_all_mutation_batches_affecting_document_key(txn, &key)
                .unwrap();
            assert_eq!(by_key, vec![a.clone()]);

            let query = Query::at_path(ResourcePath::from_string("rooms").unwrap());
            let by_query = queue.get_all_mutation_batches_affecting_query(txn, &query).unwrap();
            assert_eq!(by_query, vec![a.clone(), b.clone()]);

            let next = queue.get_next_mutation_batch_after_batch_id(txn, a.batch_id).unwrap();
            assert_eq!(next, Some(nested.clone()));

            for batch in [&a, &nested, &b] {
                queue.remove_mutation_batch(txn, batch).unwrap();
            }
            assert!(queue.check_empty(txn).unwrap());
            queue.perform_consistency_check(txn).unwrap();
            assert!(!any_queue_contains_key(txn, &key).unwrap());
        });
    }

    #[test]
    fn stores_stream_token() {
        let store = MemoryKvStore::new();
        let queue = MutationQueue::new("alice");
        with_txn(&store, |txn| {
            assert!(queue.get_last_stream_token(txn).unwrap().is_empty());
            queue.set_last_stream_token(txn, b"token").unwrap();
            assert_eq!(queue.get_last_stream_token(txn).unwrap(), b"token".to_vec());
        });
    }
}
