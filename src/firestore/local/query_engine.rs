//! Executes queries against the local store without secondary indexes.
//!
//! When a target has been in sync with no limbo documents at some version,
//! the documents it contained then (its remote keys) plus everything changed
//! since that version are enough to compute the current result; a full
//! collection scan is the fallback.

use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{Document, DocumentKey, MaybeDocument, SnapshotVersion};

#[derive(Clone, Copy, Debug, Default)]
pub struct QueryEngine;

impl QueryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents_view: &LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return self.execute_full_collection_scan(txn, documents_view, query);
        }

        let documents = documents_view.get_documents(txn, remote_keys)?;
        let previous_results = apply_query(query, documents);

        if query.limit().is_some()
            && needs_refill(
                query.limit_type(),
                &previous_results,
                remote_keys,
                last_limbo_free_snapshot_version,
            )
        {
            return self.execute_full_collection_scan(txn, documents_view, query);
        }

        log::debug!(
            "Re-using previous result from {last_limbo_free_snapshot_version} to execute query: {}",
            query.canonical_id()
        );
        let mut results = documents_view.get_documents_matching_query(
            txn,
            query,
            last_limbo_free_snapshot_version,
        )?;
        for doc in previous_results {
            results.insert(doc.key().clone(), doc);
        }
        Ok(results)
    }

    fn execute_full_collection_scan(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents_view: &LocalDocumentsView,
        query: &Query,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        log::debug!("Using full collection scan to execute query: {}", query.canonical_id());
        documents_view.get_documents_matching_query(txn, query, SnapshotVersion::min())
    }
}

/// Documents of `documents` that match `query`, in query order.
fn apply_query(query: &Query, documents: BTreeMap<DocumentKey, Option<MaybeDocument>>) -> Vec<Document> {
    let comparator = query.comparator();
    let mut results: Vec<Document> = documents
        .into_values()
        .filter_map(|doc| doc.and_then(MaybeDocument::into_document))
        .filter(|doc| query.matches(doc))
        .collect();
    results.sort_by(|left, right| comparator(left, right));
    results
}

/// A limit query can only reuse its previous results if none of them left
/// the result set and the document at the limit edge has not changed since
/// the result was computed.
fn needs_refill(
    limit_type: LimitType,
    sorted_previous_results: &[Document],
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let edge = match limit_type {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        Some(doc) => doc.has_pending_writes() || doc.version() > limbo_free_snapshot_version,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::kv_store::{KvStore, MemoryKvStore};
    use crate::firestore::local::mutation_queue::MutationQueue;
    use crate::firestore::local::persistence::TransactionMode;
    use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
    use crate::firestore::model::{DocumentState, FieldPath, ResourcePath};
    use crate::firestore::core::filter::{Filter, Operator};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn doc(path: &str, version: i64, matches: bool) -> Document {
        let mut data = MapValue::empty();
        data.set(
            &FieldPath::from_dot_separated("matches").unwrap(),
            FirestoreValue::from_bool(matches),
        );
        Document::new(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_seconds(version),
            data,
            DocumentState::Synced,
        )
    }

    fn filtered_query() -> Query {
        Query::at_path(ResourcePath::from_string("coll").unwrap()).with_filter(Filter::field(
            FieldPath::from_dot_separated("matches").unwrap(),
            Operator::Equal,
            FirestoreValue::from_bool(true),
        ))
    }

    struct Fixture {
        store: MemoryKvStore,
        cache: RemoteDocumentCache,
        view: LocalDocumentsView,
    }

    impl Fixture {
        fn new() -> Self {
            let cache = RemoteDocumentCache::new();
            Self {
                store: MemoryKvStore::new(),
                cache,
                view: LocalDocumentsView::new(cache, MutationQueue::new("")),
            }
        }

        fn add(&self, docs: &[Document]) {
            let mut txn = PersistenceTransaction::new(self.store.begin().unwrap(), TransactionMode::ReadWrite);
            for doc in docs {
                self.cache
                    .add_entry(&mut txn, &doc.clone().into(), doc.version())
                    .unwrap();
            }
            txn.commit().unwrap();
        }

        fn run(&self, query: &Query, version: SnapshotVersion, remote_keys: &[&str]) -> Vec<String> {
            let mut txn = PersistenceTransaction::new(self.store.begin().unwrap(), TransactionMode::ReadOnly);
            let keys = remote_keys
                .iter()
                .map(|k| DocumentKey::from_string(k).unwrap())
                .collect();
            QueryEngine::new()
                .get_documents_matching_query(&mut txn, &self.view, query, version, &keys)
                .unwrap()
                .keys()
                .map(ToString::to_string)
                .collect()
        }
    }

    #[test]
    fn combines_previous_results_with_new_changes() {
        let fixture = Fixture::new();
        fixture.add(&[doc("coll/a", 1, true), doc("coll/b", 1, true)]);
        fixture.add(&[doc("coll/c", 3, true), doc("coll/d", 3, false)]);
        let results = fixture.run(&filtered_query(), SnapshotVersion::from_seconds(2), &["coll/a"]);
        // coll/b was not in the previous result and predates the limbo-free
        // version, so only coll/a and the newer coll/c are returned.
        assert_eq!(results, vec!["coll/a", "coll/c"]);
    }

    #[test]
    fn full_scan_without_limbo_free_version() {
        let fixture = Fixture::new();
        fixture.add(&[doc("coll/a", 1, true), doc("coll/b", 1, true)]);
        let results = fixture.run(&filtered_query(), SnapshotVersion::min(), &[]);
        assert_eq!(results, vec!["coll/a", "coll/b"]);
    }

    #[test]
    fn limit_query_refills_when_result_shrank() {
        let fixture = Fixture::new();
        fixture.add(&[doc("coll/a", 1, true), doc("coll/b", 1, true), doc("coll/c", 3, false)]);
        let query = filtered_query().with_limit_to_first(2);
        // coll/c no longer matches, so the previous result lost a document.
        let results = fixture.run(&query, SnapshotVersion::from_seconds(2), &["coll/a", "coll/c"]);
        assert_eq!(results, vec!["coll/a", "coll/b"]);
    }
}
