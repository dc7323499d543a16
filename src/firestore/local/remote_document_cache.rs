//! Cache of the last known backend state of every document, indexed by read
//! time so clients can pull changes since a given version.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::encoded_key::{KeyDecoder, KeyEncoder};
use crate::firestore::local::kv_store::{prefix_successor, KeyRange, Table};
use crate::firestore::local::local_serializer::{self, DbRemoteDocument, DbRemoteDocumentGlobal};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::target_cache;
use crate::firestore::model::{Document, DocumentKey, MaybeDocument, SnapshotVersion};

const GLOBAL_KEY: &[u8] = b"global";

fn document_key(key: &DocumentKey) -> Vec<u8> {
    KeyEncoder::new().path(key.path()).finish()
}

fn read_time_key(read_time: SnapshotVersion, key: &DocumentKey) -> Vec<u8> {
    KeyEncoder::new().version(read_time).path(key.path()).finish()
}

fn collection_read_time_key(read_time: SnapshotVersion, key: &DocumentKey) -> Vec<u8> {
    KeyEncoder::new()
        .path(&key.collection_path())
        .version(read_time)
        .path(key.path())
        .finish()
}

/// Keys of every cached entry.
pub(crate) fn all_document_keys(txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<Vec<DocumentKey>> {
    txn.scan(Table::RemoteDocuments, KeyRange::all())?
        .into_iter()
        .map(|(row_key, _)| KeyDecoder::new(&row_key).document_key())
        .collect()
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RemoteDocumentCache;

impl RemoteDocumentCache {
    pub fn new() -> Self {
        Self
    }

    /// Stores `doc` as read at `read_time`, replacing any previous entry, and
    /// stamps the document's GC sentinel row.
    pub fn add_entry(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        doc: &MaybeDocument,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let key = doc.key().clone();
        let mut size_delta = self.remove_record(txn, &key)?;
        let record = local_serializer::encode(&DbRemoteDocument {
            document: doc.clone(),
            read_time,
        })?;
        size_delta += record.len() as i64;
        txn.put(Table::RemoteDocuments, document_key(&key), record)?;
        txn.put(
            Table::RemoteDocumentsByReadTime,
            read_time_key(read_time, &key),
            Vec::new(),
        )?;
        txn.put(
            Table::RemoteDocumentsByCollectionReadTime,
            collection_read_time_key(read_time, &key),
            Vec::new(),
        )?;
        self.adjust_size(txn, size_delta)?;
        target_cache::update_sentinel(txn, &key)
    }

    pub fn remove_entry(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
        let size_delta = self.remove_record(txn, key)?;
        self.adjust_size(txn, size_delta)
    }

    /// Deletes the record and its index rows, returning the size change.
    fn remove_record(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<i64> {
        let Some(bytes) = txn.get(Table::RemoteDocuments, &document_key(key))? else {
            return Ok(0);
        };
        let previous: DbRemoteDocument = local_serializer::decode(&bytes)?;
        txn.delete(Table::RemoteDocuments, &document_key(key))?;
        txn.delete(
            Table::RemoteDocumentsByReadTime,
            &read_time_key(previous.read_time, key),
        )?;
        txn.delete(
            Table::RemoteDocumentsByCollectionReadTime,
            &collection_read_time_key(previous.read_time, key),
        )?;
        Ok(-(bytes.len() as i64))
    }

    fn adjust_size(&self, txn: &mut PersistenceTransaction<'_>, delta: i64) -> FirestoreResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut global = self.read_global(txn)?;
        global.byte_size += delta;
        txn.put(
            Table::RemoteDocumentGlobal,
            GLOBAL_KEY.to_vec(),
            local_serializer::encode(&global)?,
        )
    }

    fn read_global(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<DbRemoteDocumentGlobal> {
        match txn.get(Table::RemoteDocumentGlobal, GLOBAL_KEY)? {
            Some(bytes) => local_serializer::decode(&bytes),
            None => Ok(DbRemoteDocumentGlobal::default()),
        }
    }

    /// Encoded size of all cached documents in bytes.
    pub fn get_size(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<i64> {
        Ok(self.read_global(txn)?.byte_size)
    }

    pub fn get_entry(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<MaybeDocument>> {
        match txn.get(Table::RemoteDocuments, &document_key(key))? {
            Some(bytes) => Ok(Some(local_serializer::decode::<DbRemoteDocument>(&bytes)?.document)),
            None => Ok(None),
        }
    }

    pub fn get_entries<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<MaybeDocument>>> {
        let mut results = BTreeMap::new();
        for key in keys {
            results.insert(key.clone(), self.get_entry(txn, key)?);
        }
        Ok(results)
    }

    /// Cached documents matching `query`, ignoring its limit. With a
    /// `since_read_time`, only documents read after that version are returned.
    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let candidates: Vec<MaybeDocument> = if query.is_collection_group_query() {
            self.scan_documents(txn, KeyRange::all())?
        } else if !since_read_time.is_min() && !query.is_document_query() {
            self.scan_collection_since(txn, query, since_read_time)?
        } else {
            let prefix = KeyEncoder::new().path_prefix(query.path()).finish();
            self.scan_documents(txn, KeyRange::prefix(prefix))?
        };

        Ok(candidates
            .into_iter()
            .filter_map(MaybeDocument::into_document)
            .filter(|doc| query.matches(doc))
            .map(|doc| (doc.key().clone(), doc))
            .collect())
    }

    fn scan_documents(&self, txn: &mut PersistenceTransaction<'_>, range: KeyRange) -> FirestoreResult<Vec<MaybeDocument>> {
        txn.scan(Table::RemoteDocuments, range)?
            .into_iter()
            .map(|(_, value)| Ok(local_serializer::decode::<DbRemoteDocument>(&value)?.document))
            .collect()
    }

    fn scan_collection_since(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<Vec<MaybeDocument>> {
        let collection = KeyEncoder::new().path(query.path()).finish();
        let at_since = KeyEncoder::new().path(query.path()).version(since_read_time).finish();
        let start = match prefix_successor(&at_since) {
            Some(start) => Bound::Included(start),
            None => return Ok(Vec::new()),
        };
        let end = match prefix_successor(&collection) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        let mut documents = Vec::new();
        for (row_key, _) in txn.scan(
            Table::RemoteDocumentsByCollectionReadTime,
            KeyRange::between(start, end),
        )? {
            let mut decoder = KeyDecoder::new(&row_key);
            decoder.path()?;
            decoder.version()?;
            let key = decoder.document_key()?;
            if let Some(doc) = self.get_entry(txn, &key)? {
                documents.push(doc);
            }
        }
        Ok(documents)
    }

    /// Entries written with a read time after `since`, along with the highest
    /// read time seen.
    pub fn get_new_document_changes(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        since: SnapshotVersion,
    ) -> FirestoreResult<(BTreeMap<DocumentKey, MaybeDocument>, SnapshotVersion)> {
        let at_since = KeyEncoder::new().version(since).finish();
        let Some(start) = prefix_successor(&at_since) else {
            return Ok((BTreeMap::new(), since));
        };
        let mut changes = BTreeMap::new();
        let mut read_time = since;
        for (row_key, _) in txn.scan(
            Table::RemoteDocumentsByReadTime,
            KeyRange::between(Bound::Included(start), Bound::Unbounded),
        )? {
            let mut decoder = KeyDecoder::new(&row_key);
            read_time = read_time.max(decoder.version()?);
            let key = decoder.document_key()?;
            if let Some(doc) = self.get_entry(txn, &key)? {
                changes.insert(key, doc);
            }
        }
        Ok((changes, read_time))
    }

    /// Highest read time of any cached entry.
    pub fn get_last_read_time(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<SnapshotVersion> {
        let last = txn.scan(
            Table::RemoteDocumentsByReadTime,
            KeyRange::all().reversed().with_limit(1),
        )?;
        match last.first() {
            Some((row_key, _)) => KeyDecoder::new(row_key).version(),
            None => Ok(SnapshotVersion::min()),
        }
    }
}
