//! Persisted targets, the documents each target matches and the global
//! target metadata. Target id 0 is reserved for GC sentinel rows, which
//! record the last sequence number at which a document was referenced.

use std::collections::BTreeSet;

use crate::firestore::core::target::Target;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::types::{ListenSequenceNumber, TargetId};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::encoded_key::{KeyDecoder, KeyEncoder};
use crate::firestore::local::kv_store::{KeyRange, Table};
use crate::firestore::local::local_serializer::{self, DbTargetDocument, DbTargetGlobal};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DocumentKey, SnapshotVersion};

const GLOBAL_KEY: &[u8] = b"global";
pub const SENTINEL_TARGET_ID: TargetId = 0;

fn target_key(target_id: TargetId) -> Vec<u8> {
    KeyEncoder::new().i32(target_id).finish()
}

fn canonical_id_key(canonical_id: &str, target_id: TargetId) -> Vec<u8> {
    KeyEncoder::new().string(canonical_id).i32(target_id).finish()
}

fn target_document_key(target_id: TargetId, key: &DocumentKey) -> Vec<u8> {
    KeyEncoder::new().i32(target_id).path(key.path()).finish()
}

fn document_target_key(key: &DocumentKey, target_id: TargetId) -> Vec<u8> {
    KeyEncoder::new().path(key.path()).i32(target_id).finish()
}

pub(crate) fn read_global(txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<DbTargetGlobal> {
    match txn.get(Table::TargetGlobal, GLOBAL_KEY)? {
        Some(bytes) => local_serializer::decode(&bytes),
        None => Ok(DbTargetGlobal::default()),
    }
}

fn write_global(txn: &mut PersistenceTransaction<'_>, global: &DbTargetGlobal) -> FirestoreResult<()> {
    txn.put(
        Table::TargetGlobal,
        GLOBAL_KEY.to_vec(),
        local_serializer::encode(global)?,
    )
}

/// Takes the next listen sequence number and persists it as the highest.
pub(crate) fn allocate_sequence_number(
    txn: &mut PersistenceTransaction<'_>,
) -> FirestoreResult<ListenSequenceNumber> {
    let mut global = read_global(txn)?;
    global.highest_listen_sequence_number += 1;
    write_global(txn, &global)?;
    Ok(global.highest_listen_sequence_number)
}

pub(crate) fn sentinel_sequence_number(
    txn: &mut PersistenceTransaction<'_>,
    key: &DocumentKey,
) -> FirestoreResult<Option<ListenSequenceNumber>> {
    match txn.get(Table::TargetDocuments, &target_document_key(SENTINEL_TARGET_ID, key))? {
        Some(bytes) => Ok(local_serializer::decode::<DbTargetDocument>(&bytes)?.sequence_number),
        None => Ok(None),
    }
}

pub(crate) fn write_sentinel(
    txn: &mut PersistenceTransaction<'_>,
    key: &DocumentKey,
    sequence_number: ListenSequenceNumber,
) -> FirestoreResult<()> {
    let value = local_serializer::encode(&DbTargetDocument {
        sequence_number: Some(sequence_number),
    })?;
    txn.put(
        Table::TargetDocuments,
        target_document_key(SENTINEL_TARGET_ID, key),
        value.clone(),
    )?;
    txn.put(
        Table::DocumentTargets,
        document_target_key(key, SENTINEL_TARGET_ID),
        value,
    )
}

/// Stamps the sentinel row of `key` with the transaction's sequence number.
pub(crate) fn update_sentinel(txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
    let sequence_number = txn.current_sequence_number()?;
    write_sentinel(txn, key, sequence_number)
}

pub(crate) fn remove_sentinel(txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
    txn.delete(
        Table::TargetDocuments,
        &target_document_key(SENTINEL_TARGET_ID, key),
    )?;
    txn.delete(
        Table::DocumentTargets,
        &document_target_key(key, SENTINEL_TARGET_ID),
    )
}

/// True if any target other than the sentinel references `key`.
pub(crate) fn is_referenced_by_target(
    txn: &mut PersistenceTransaction<'_>,
    key: &DocumentKey,
) -> FirestoreResult<bool> {
    let prefix = KeyEncoder::new().path(key.path()).finish();
    for (row_key, _) in txn.scan(Table::DocumentTargets, KeyRange::prefix(prefix))? {
        let mut decoder = KeyDecoder::new(&row_key);
        decoder.path()?;
        if decoder.i32()? != SENTINEL_TARGET_ID {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Every document with a sentinel row, with its sequence number.
pub(crate) fn sentinel_rows(
    txn: &mut PersistenceTransaction<'_>,
) -> FirestoreResult<Vec<(DocumentKey, ListenSequenceNumber)>> {
    let prefix = KeyEncoder::new().i32(SENTINEL_TARGET_ID).finish();
    let mut rows = Vec::new();
    for (row_key, value) in txn.scan(Table::TargetDocuments, KeyRange::prefix(prefix))? {
        let mut decoder = KeyDecoder::new(&row_key);
        decoder.i32()?;
        let key = decoder.document_key()?;
        let record: DbTargetDocument = local_serializer::decode(&value)?;
        rows.push((key, record.sequence_number.unwrap_or_default()));
    }
    Ok(rows)
}

/// Persisted targets and their matching documents.
#[derive(Clone, Copy, Debug, Default)]
pub struct TargetCache;

impl TargetCache {
    pub fn new() -> Self {
        Self
    }

    /// Allocates an even target id above every id handed out so far.
    pub fn allocate_target_id(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<TargetId> {
        let mut global = read_global(txn)?;
        let target_id = TargetIdGenerator::for_target_cache(global.highest_target_id).next();
        global.highest_target_id = target_id;
        write_global(txn, &global)?;
        Ok(target_id)
    }

    pub fn get_last_remote_snapshot_version(
        &self,
        txn: &mut PersistenceTransaction<'_>,
    ) -> FirestoreResult<SnapshotVersion> {
        Ok(read_global(txn)?.last_remote_snapshot_version)
    }

    pub fn set_last_remote_snapshot_version(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let mut global = read_global(txn)?;
        global.last_remote_snapshot_version = version;
        write_global(txn, &global)
    }

    pub fn get_highest_sequence_number(
        &self,
        txn: &mut PersistenceTransaction<'_>,
    ) -> FirestoreResult<ListenSequenceNumber> {
        Ok(read_global(txn)?.highest_listen_sequence_number)
    }

    pub fn get_target_count(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<i64> {
        Ok(read_global(txn)?.target_count)
    }

    pub fn add_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        self.save_target_data(txn, target_data)?;
        let mut global = read_global(txn)?;
        global.target_count += 1;
        global.highest_target_id = global.highest_target_id.max(target_data.target_id);
        global.highest_listen_sequence_number = global
            .highest_listen_sequence_number
            .max(target_data.sequence_number);
        write_global(txn, &global)
    }

    pub fn update_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        self.save_target_data(txn, target_data)?;
        let mut global = read_global(txn)?;
        if target_data.sequence_number > global.highest_listen_sequence_number {
            global.highest_listen_sequence_number = target_data.sequence_number;
            write_global(txn, &global)?;
        }
        Ok(())
    }

    fn save_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        txn.put(
            Table::Targets,
            target_key(target_data.target_id),
            local_serializer::encode_target(target_data)?,
        )?;
        txn.put(
            Table::TargetsByCanonicalId,
            canonical_id_key(&target_data.target.canonical_id(), target_data.target_id),
            Vec::new(),
        )
    }

    /// Deletes the target along with its document associations.
    pub fn remove_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        self.remove_matching_keys_for_target(txn, target_data.target_id)?;
        txn.delete(Table::Targets, &target_key(target_data.target_id))?;
        txn.delete(
            Table::TargetsByCanonicalId,
            &canonical_id_key(&target_data.target.canonical_id(), target_data.target_id),
        )?;
        let mut global = read_global(txn)?;
        global.target_count -= 1;
        write_global(txn, &global)
    }

    /// Removes every target whose sequence number is at most `upper_bound`
    /// and that is not in `active_target_ids`. Returns how many were removed.
    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<usize> {
        let mut removed = 0;
        for target_data in self.all_targets(txn)? {
            if target_data.sequence_number <= upper_bound
                && !active_target_ids.contains(&target_data.target_id)
            {
                self.remove_target_data(txn, &target_data)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn all_targets(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<Vec<TargetData>> {
        txn.scan(Table::Targets, KeyRange::all())?
            .into_iter()
            .map(|(_, value)| local_serializer::decode_target(&value))
            .collect()
    }

    /// Looks a target up by its canonical id, comparing full targets to rule
    /// out canonical id collisions.
    pub fn get_target_data(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target: &Target,
    ) -> FirestoreResult<Option<TargetData>> {
        let prefix = KeyEncoder::new().string(&target.canonical_id()).finish();
        for (row_key, _) in txn.scan(Table::TargetsByCanonicalId, KeyRange::prefix(prefix))? {
            let mut decoder = KeyDecoder::new(&row_key);
            decoder.string()?;
            let target_id = decoder.i32()?;
            if let Some(target_data) = self.get_target_data_for_id(txn, target_id)? {
                if &target_data.target == target {
                    return Ok(Some(target_data));
                }
            }
        }
        Ok(None)
    }

    pub fn get_target_data_for_id(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> FirestoreResult<Option<TargetData>> {
        txn.get(Table::Targets, &target_key(target_id))?
            .map(|bytes| local_serializer::decode_target(&bytes))
            .transpose()
    }

    pub fn add_matching_keys<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        let value = local_serializer::encode(&DbTargetDocument::default())?;
        for key in keys {
            txn.put(
                Table::TargetDocuments,
                target_document_key(target_id, key),
                value.clone(),
            )?;
            txn.put(
                Table::DocumentTargets,
                document_target_key(key, target_id),
                value.clone(),
            )?;
            update_sentinel(txn, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        for key in keys {
            txn.delete(Table::TargetDocuments, &target_document_key(target_id, key))?;
            txn.delete(Table::DocumentTargets, &document_target_key(key, target_id))?;
            update_sentinel(txn, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys_for_target(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        for key in self.get_matching_keys_for_target(txn, target_id)? {
            txn.delete(Table::TargetDocuments, &target_document_key(target_id, &key))?;
            txn.delete(Table::DocumentTargets, &document_target_key(&key, target_id))?;
        }
        Ok(())
    }

    pub fn get_matching_keys_for_target(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let prefix = KeyEncoder::new().i32(target_id).finish();
        let mut keys = BTreeSet::new();
        for (row_key, _) in txn.scan(Table::TargetDocuments, KeyRange::prefix(prefix))? {
            let mut decoder = KeyDecoder::new(&row_key);
            decoder.i32()?;
            keys.insert(decoder.document_key()?);
        }
        Ok(keys)
    }

    pub fn contains_key(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<bool> {
        is_referenced_by_target(txn, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::kv_store::{KvStore, MemoryKvStore};
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::target_data::TargetPurpose;
    use crate::firestore::model::ResourcePath;

    fn with_txn<T>(store: &MemoryKvStore, f: impl FnOnce(&mut PersistenceTransaction<'_>) -> T) -> T {
        let mut txn = PersistenceTransaction::new(store.begin().unwrap(), TransactionMode::ReadWrite);
        let result = f(&mut txn);
        txn.commit().unwrap();
        result
    }

    fn target(path: &str) -> Target {
        Query::at_path(ResourcePath::from_string(path).unwrap()).to_target()
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn allocates_increasing_even_ids() {
        let store = MemoryKvStore::new();
        let cache = TargetCache::new();
        with_txn(&store, |txn| {
            assert_eq!(cache.allocate_target_id(txn).unwrap(), 2);
            assert_eq!(cache.allocate_target_id(txn).unwrap(), 4);
        });
        with_txn(&store, |txn| {
            assert_eq!(cache.allocate_target_id(txn).unwrap(), 6);
        });
    }

    #[test]
    fn finds_targets_by_value() {
        let store = MemoryKvStore::new();
        let cache = TargetCache::new();
        with_txn(&store, |txn| {
            let data = TargetData::new(target("rooms"), 2, TargetPurpose::Listen, 1);
            cache.add_target_data(txn, &data).unwrap();
            assert_eq!(cache.get_target_data(txn, &target("rooms")).unwrap(), Some(data.clone()));
            assert_eq!(cache.get_target_data(txn, &target("users")).unwrap(), None);
            assert_eq!(cache.get_target_count(txn).unwrap(), 1);

            cache.remove_target_data(txn, &data).unwrap();
            assert_eq!(cache.get_target_data_for_id(txn, 2).unwrap(), None);
            assert_eq!(cache.get_target_count(txn).unwrap(), 0);
        });
    }

    #[test]
    fn tracks_matching_keys_and_sentinels() {
        let store = MemoryKvStore::new();
        let cache = TargetCache::new();
        with_txn(&store, |txn| {
            let a = key("rooms/a");
            let b = key("rooms/b");
            cache.add_matching_keys(txn, [&a, &b], 2).unwrap();
            assert_eq!(
                cache.get_matching_keys_for_target(txn, 2).unwrap(),
                BTreeSet::from([a.clone(), b.clone()])
            );
            assert!(cache.contains_key(txn, &a).unwrap());
            assert!(sentinel_sequence_number(txn, &a).unwrap().is_some());

            cache.remove_matching_keys(txn, [&a], 2).unwrap();
            assert!(!cache.contains_key(txn, &a).unwrap());
            assert!(cache.contains_key(txn, &b).unwrap());
        });
    }

    #[test]
    fn removes_inactive_targets_up_to_bound() {
        let store = MemoryKvStore::new();
        let cache = TargetCache::new();
        with_txn(&store, |txn| {
            for (id, seq) in [(2, 1), (4, 2), (6, 10)] {
                let data = TargetData::new(target(&format!("c{id}")), id, TargetPurpose::Listen, seq);
                cache.add_target_data(txn, &data).unwrap();
            }
            let removed = cache
                .remove_targets(txn, 5, &BTreeSet::from([4]))
                .unwrap();
            assert_eq!(removed, 1);
            assert!(cache.get_target_data_for_id(txn, 2).unwrap().is_none());
            assert!(cache.get_target_data_for_id(txn, 4).unwrap().is_some());
            assert!(cache.get_target_data_for_id(txn, 6).unwrap().is_some());
        });
    }
}
