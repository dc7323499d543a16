use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::model::{Document, DocumentKey, MaybeDocument, Mutation, MutationBatch, SnapshotVersion};

/// Cached documents with the current user's pending writes applied on top.
#[derive(Clone, Debug)]
pub struct LocalDocumentsView {
    remote_documents: RemoteDocumentCache,
    mutation_queue: MutationQueue,
}

impl LocalDocumentsView {
    pub fn new(remote_documents: RemoteDocumentCache, mutation_queue: MutationQueue) -> Self {
        Self {
            remote_documents,
            mutation_queue,
        }
    }

    pub fn get_document(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<MaybeDocument>> {
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_key(txn, key)?;
        let remote = self.remote_documents.get_entry(txn, key)?;
        Ok(apply_batches(key, remote, &batches))
    }

    /// Local view of every key in `keys`; `None` means no local state.
    pub fn get_documents<'k>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<MaybeDocument>>> {
        let remote = self.remote_documents.get_entries(txn, keys)?;
        self.get_local_view_of_documents(txn, remote)
    }

    /// Applies pending batches to already-read remote documents.
    pub fn get_local_view_of_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        docs: BTreeMap<DocumentKey, Option<MaybeDocument>>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<MaybeDocument>>> {
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(txn, docs.keys())?;
        Ok(docs
            .into_iter()
            .map(|(key, remote)| {
                let local = apply_batches(&key, remote, &batches);
                (key, local)
            })
            .collect())
    }

    /// Local documents matching `query`, ignoring its limit. Only remote
    /// documents read after `since_read_time` are considered, but pending
    /// writes always are.
    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        if query.is_document_query() {
            return self.get_documents_matching_document_query(txn, query);
        }

        let mut results = self
            .remote_documents
            .get_documents_matching_query(txn, query, since_read_time)?;
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_query(txn, query)?;
        self.add_missing_base_documents(txn, &batches, &mut results)?;

        for batch in &batches {
            for mutation in &batch.mutations {
                let key = mutation.key();
                if !in_query_scope(query, key) {
                    continue;
                }
                let base: Option<MaybeDocument> = results.get(key).cloned().map(Into::into);
                match mutation.apply_to_local_view(base.as_ref(), base.as_ref(), batch.local_write_time) {
                    Some(MaybeDocument::Document(doc)) => {
                        results.insert(key.clone(), doc);
                    }
                    _ => {
                        results.remove(key);
                    }
                }
            }
        }

        results.retain(|_, doc| query.matches(doc));
        Ok(results)
    }

    fn get_documents_matching_document_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let key = DocumentKey::from_path(query.path().clone())?;
        let mut results = BTreeMap::new();
        if let Some(MaybeDocument::Document(doc)) = self.get_document(txn, &key)? {
            results.insert(key, doc);
        }
        Ok(results)
    }

    /// Patches only apply to existing documents, so a patched document that
    /// the read-time filter skipped has to be read explicitly.
    fn add_missing_base_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batches: &[MutationBatch],
        results: &mut BTreeMap<DocumentKey, Document>,
    ) -> FirestoreResult<()> {
        let missing: BTreeSet<DocumentKey> = batches
            .iter()
            .flat_map(|batch| batch.mutations.iter())
            .filter(|mutation| matches!(mutation, Mutation::Patch { .. }))
            .map(|mutation| mutation.key().clone())
            .filter(|key| !results.contains_key(key))
            .collect();
        for (key, doc) in self.remote_documents.get_entries(txn, &missing)? {
            if let Some(MaybeDocument::Document(doc)) = doc {
                results.insert(key, doc);
            }
        }
        Ok(())
    }
}

fn in_query_scope(query: &Query, key: &DocumentKey) -> bool {
    match query.collection_group_id() {
        Some(group) => key.collection_group() == group && query.path().is_prefix_of(key.path()),
        None => query.path().is_immediate_parent_of(key.path()),
    }
}

fn apply_batches(
    key: &DocumentKey,
    mut doc: Option<MaybeDocument>,
    batches: &[MutationBatch],
) -> Option<MaybeDocument> {
    for batch in batches {
        doc = batch.apply_to_local_view(key, doc);
    }
    doc
}
