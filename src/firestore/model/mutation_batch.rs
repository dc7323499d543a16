use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::core::types::BatchId;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{DocumentKey, MaybeDocument, Mutation, MutationResult, SnapshotVersion, Timestamp};
use crate::firestore::util::assert::hard_assert;

/// Writes that were issued together and are committed atomically.
///
/// `base_mutations` seed the values non-idempotent transforms start from and
/// are applied before the user's `mutations` when computing the local view.
/// They are never sent to the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        hard_assert(!mutations.is_empty(), "Cannot create an empty mutation batch");
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    /// Applies the acknowledged writes for `key` in batch order.
    pub fn apply_to_remote_document(
        &self,
        key: &DocumentKey,
        mut maybe_doc: Option<MaybeDocument>,
        batch_result: &MutationBatchResult,
    ) -> Option<MaybeDocument> {
        if let Some(doc) = &maybe_doc {
            hard_assert(
                doc.key() == key,
                format!("apply_to_remote_document: key {key} doesn't match {}", doc.key()),
            );
        }
        for (mutation, result) in self.mutations.iter().zip(&batch_result.mutation_results) {
            if mutation.key() == key {
                maybe_doc = mutation.apply_to_remote_document(maybe_doc.as_ref(), result);
            }
        }
        maybe_doc
    }

    /// Folds the batch over `maybe_doc` for `key`: base mutations first, then
    /// user mutations in order.
    pub fn apply_to_local_view(
        &self,
        key: &DocumentKey,
        mut maybe_doc: Option<MaybeDocument>,
    ) -> Option<MaybeDocument> {
        let base_doc = maybe_doc.clone();
        for mutation in self.base_mutations.iter().chain(self.mutations.iter()) {
            if mutation.key() == key {
                maybe_doc =
                    mutation.apply_to_local_view(maybe_doc.as_ref(), base_doc.as_ref(), self.local_write_time);
            }
        }
        maybe_doc
    }

    /// Applies the batch to every entry of `docs`, which must contain all keys
    /// the batch touches.
    pub fn apply_to_local_document_set(
        &self,
        docs: &mut BTreeMap<DocumentKey, Option<MaybeDocument>>,
    ) {
        for key in self.keys() {
            let current = docs.remove(&key).flatten();
            let updated = self.apply_to_local_view(&key, current);
            docs.insert(key, updated);
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|m| m.key().clone()).collect()
    }
}

/// A batch together with the backend's response to committing it.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each written document reached, taken from the per-write results.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from_results(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{
        Document, DocumentState, FieldMask, FieldPath, FieldTransform, TransformOperation,
    };
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
        let mut value = MapValue::empty();
        for (path, entry) in entries {
            value.set(&field(path), entry.clone());
        }
        value
    }

    fn increment(path: &str, by: i64) -> Mutation {
        Mutation::transform(
            key(path),
            vec![FieldTransform::new(
                field("count"),
                TransformOperation::numeric_increment(FirestoreValue::from_integer(by)).unwrap(),
            )],
        )
    }

    #[test]
    fn applies_mutations_as_left_fold() {
        let batch = MutationBatch::new(
            1,
            Timestamp::new(1, 0),
            vec![],
            vec![
                Mutation::set(key("c/a"), map(&[("x", FirestoreValue::from_integer(1))])),
                Mutation::patch(
                    key("c/a"),
                    map(&[("y", FirestoreValue::from_integer(2))]),
                    FieldMask::from_paths([field("y")]),
                ),
                Mutation::patch(
                    key("c/a"),
                    map(&[]),
                    FieldMask::from_paths([field("x")]),
                ),
            ],
        );
        let result = batch.apply_to_local_view(&key("c/a"), None).unwrap();
        assert_eq!(
            result.as_document().unwrap().data(),
            &map(&[("y", FirestoreValue::from_integer(2))])
        );
    }

    #[test]
    fn base_mutations_make_replays_deterministic() {
        let remote: MaybeDocument = Document::new(
            key("c/a"),
            SnapshotVersion::from_seconds(1),
            map(&[("count", FirestoreValue::from_integer(10))]),
            DocumentState::Synced,
        )
        .into();
        let base_value = increment("c/a", 1).extract_base_value(Some(&remote)).unwrap();
        let batch = MutationBatch::new(
            1,
            Timestamp::new(1, 0),
            vec![Mutation::patch(key("c/a"), base_value.clone(), base_value.field_mask())],
            vec![increment("c/a", 1)],
        );

        let once = batch.apply_to_local_view(&key("c/a"), Some(remote));
        let twice = batch.apply_to_local_view(&key("c/a"), once.clone());
        assert_eq!(once, twice);
        assert_eq!(
            once.unwrap().as_document().unwrap().field(&field("count")),
            Some(&FirestoreValue::from_integer(11))
        );
    }

    #[test]
    fn result_requires_matching_lengths() {
        let batch = MutationBatch::new(
            3,
            Timestamp::new(1, 0),
            vec![],
            vec![Mutation::delete(key("c/a"))],
        );
        let err = MutationBatchResult::from_results(batch.clone(), SnapshotVersion::from_seconds(1), vec![], vec![])
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/internal");

        let result = MutationBatchResult::from_results(
            batch,
            SnapshotVersion::from_seconds(4),
            vec![MutationResult::new(SnapshotVersion::from_seconds(3), None)],
            vec![1],
        )
        .unwrap();
        assert_eq!(
            result.doc_versions.get(&key("c/a")),
            Some(&SnapshotVersion::from_seconds(3))
        );
    }

    #[test]
    fn fills_local_document_set() {
        let batch = MutationBatch::new(
            1,
            Timestamp::new(1, 0),
            vec![],
            vec![Mutation::set(key("c/b"), MapValue::empty())],
        );
        let mut docs = BTreeMap::new();
        docs.insert(key("c/b"), None);
        batch.apply_to_local_document_set(&mut docs);
        assert!(docs.get(&key("c/b")).unwrap().as_ref().unwrap().is_document());
    }
}
