//! Mutations and the rules for applying them to cached documents.
//!
//! Every (mutation, prior state) combination is handled by the match arms in
//! [`Mutation::apply_to_local_view`] and [`Mutation::apply_to_remote_document`].

use serde::{Deserialize, Serialize};

use crate::firestore::model::{
    Document, DocumentKey, DocumentState, FieldMask, FieldTransform, MaybeDocument, NoDocument,
    SnapshotVersion, Timestamp, UnknownDocument,
};
use crate::firestore::util::assert::{fail, hard_assert};
use crate::firestore::value::{FirestoreValue, MapValue};

/// Condition the backend checks before applying a mutation.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub enum Precondition {
    #[default]
    None,
    /// The document must exist (`true`) or must not exist (`false`).
    Exists(bool),
    /// The document must exist at exactly this version.
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, maybe_doc: Option<&MaybeDocument>) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => {
                *exists == matches!(maybe_doc, Some(MaybeDocument::Document(_)))
            }
            Precondition::UpdateTime(version) => match maybe_doc {
                Some(MaybeDocument::Document(doc)) => doc.version() == *version,
                _ => false,
            },
        }
    }
}

/// Outcome of a single write reported by the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    /// Update time of the document after the write, or the commit time when
    /// the write did not change the document.
    pub version: SnapshotVersion,
    /// One value per field transform, present only for transform mutations.
    pub transform_results: Option<Vec<FirestoreValue>>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Option<Vec<FirestoreValue>>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Replaces the whole document.
    Set {
        key: DocumentKey,
        value: MapValue,
        precondition: Precondition,
    },
    /// Writes the fields in `field_mask`; masked fields missing from `data` are deleted.
    Patch {
        key: DocumentKey,
        data: MapValue,
        field_mask: FieldMask,
        precondition: Precondition,
    },
    /// Applies field transforms to an existing document.
    Transform {
        key: DocumentKey,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    /// Only checks the precondition. Used by transactions.
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
        }
    }

    /// Update of existing fields. Does nothing when the document is absent.
    pub fn patch(key: DocumentKey, data: MapValue, field_mask: FieldMask) -> Self {
        Mutation::Patch {
            key,
            data,
            field_mask,
            precondition: Precondition::Exists(true),
        }
    }

    /// Merge write. Creates the document when it is absent.
    pub fn merge(key: DocumentKey, data: MapValue, field_mask: FieldMask) -> Self {
        Mutation::Patch {
            key,
            data,
            field_mask,
            precondition: Precondition::None,
        }
    }

    pub fn transform(key: DocumentKey, field_transforms: Vec<FieldTransform>) -> Self {
        Mutation::Transform {
            key,
            field_transforms,
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify { key, precondition }
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Transform { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition.clone(),
            Mutation::Transform { .. } => Precondition::Exists(true),
        }
    }

    /// Applies the mutation optimistically, before the backend has seen it.
    ///
    /// `base_doc` is the document as it was before the enclosing batch started;
    /// transforms fall back to it when a prior mutation in the batch cleared a field.
    pub fn apply_to_local_view(
        &self,
        maybe_doc: Option<&MaybeDocument>,
        base_doc: Option<&MaybeDocument>,
        local_write_time: Timestamp,
    ) -> Option<MaybeDocument> {
        if let Mutation::Verify { .. } = self {
            fail("Verify mutations are only used in transactions");
        }
        if !self.precondition().is_valid_for(maybe_doc) {
            return maybe_doc.cloned();
        }

        let key = self.key().clone();
        match self {
            Mutation::Set { value, .. } => Some(
                Document::new(
                    key,
                    post_mutation_version(maybe_doc),
                    value.clone(),
                    DocumentState::LocalMutations,
                )
                .into(),
            ),
            Mutation::Patch {
                data, field_mask, ..
            } => Some(
                Document::new(
                    key,
                    post_mutation_version(maybe_doc),
                    patch_object(existing_data(maybe_doc), data, field_mask),
                    DocumentState::LocalMutations,
                )
                .into(),
            ),
            Mutation::Transform {
                field_transforms, ..
            } => {
                let doc = require_document(maybe_doc);
                let results: Vec<FirestoreValue> = field_transforms
                    .iter()
                    .map(|field_transform| {
                        let mut previous = doc.field(&field_transform.field);
                        if previous.is_none() {
                            if let Some(MaybeDocument::Document(base)) = base_doc {
                                previous = base.field(&field_transform.field);
                            }
                        }
                        field_transform
                            .transform
                            .apply_to_local_view(previous, local_write_time)
                    })
                    .collect();
                let data = transform_object(doc.data().clone(), field_transforms, results);
                Some(Document::new(key, doc.version(), data, DocumentState::LocalMutations).into())
            }
            Mutation::Delete { .. } => {
                Some(NoDocument::new(key, SnapshotVersion::min(), false).into())
            }
            Mutation::Verify { .. } => maybe_doc.cloned(),
        }
    }

    /// Applies the mutation once the backend acknowledged it with `result`.
    pub fn apply_to_remote_document(
        &self,
        maybe_doc: Option<&MaybeDocument>,
        result: &MutationResult,
    ) -> Option<MaybeDocument> {
        let key = self.key().clone();
        match self {
            Mutation::Set { value, .. } => {
                hard_assert(
                    result.transform_results.is_none(),
                    "Transform results received by a set mutation",
                );
                Some(
                    Document::new(
                        key,
                        result.version,
                        value.clone(),
                        DocumentState::CommittedMutations,
                    )
                    .into(),
                )
            }
            Mutation::Patch {
                data,
                field_mask,
                precondition,
                ..
            } => {
                hard_assert(
                    result.transform_results.is_none(),
                    "Transform results received by a patch mutation",
                );
                if !precondition.is_valid_for(maybe_doc) {
                    // The write went through on the backend but the cached base
                    // is unusable, so only the document's existence is known.
                    return Some(UnknownDocument::new(key, result.version).into());
                }
                Some(
                    Document::new(
                        key,
                        result.version,
                        patch_object(existing_data(maybe_doc), data, field_mask),
                        DocumentState::CommittedMutations,
                    )
                    .into(),
                )
            }
            Mutation::Transform {
                field_transforms, ..
            } => {
                let server_results = match &result.transform_results {
                    Some(values) => values,
                    None => fail("Transform results missing for a transform mutation"),
                };
                hard_assert(
                    server_results.len() == field_transforms.len(),
                    format!(
                        "Server transform result count ({}) should match field transform count ({})",
                        server_results.len(),
                        field_transforms.len()
                    ),
                );
                if !self.precondition().is_valid_for(maybe_doc) {
                    return Some(UnknownDocument::new(key, result.version).into());
                }
                let doc = require_document(maybe_doc);
                let results: Vec<FirestoreValue> = field_transforms
                    .iter()
                    .zip(server_results.iter())
                    .map(|(field_transform, server_value)| {
                        field_transform.transform.apply_to_remote_document(
                            doc.field(&field_transform.field),
                            server_value.clone(),
                        )
                    })
                    .collect();
                let data = transform_object(doc.data().clone(), field_transforms, results);
                Some(
                    Document::new(key, result.version, data, DocumentState::CommittedMutations)
                        .into(),
                )
            }
            Mutation::Delete { .. } => {
                hard_assert(
                    result.transform_results.is_none(),
                    "Transform results received by a delete mutation",
                );
                Some(NoDocument::new(key, result.version, true).into())
            }
            Mutation::Verify { .. } => fail("Verify mutations are only used in transactions"),
        }
    }

    /// Seed values for non-idempotent transforms, computed against the
    /// current local view of the document.
    pub fn extract_base_value(&self, maybe_doc: Option<&MaybeDocument>) -> Option<MapValue> {
        let Mutation::Transform {
            field_transforms, ..
        } = self
        else {
            return None;
        };

        let doc = maybe_doc.and_then(MaybeDocument::as_document);
        let mut base = MapValue::empty();
        let mut found = false;
        for field_transform in field_transforms {
            let existing = doc.and_then(|doc| doc.field(&field_transform.field));
            if let Some(value) = field_transform.transform.compute_base_value(existing) {
                base.set(&field_transform.field, value);
                found = true;
            }
        }
        found.then_some(base)
    }
}

fn post_mutation_version(maybe_doc: Option<&MaybeDocument>) -> SnapshotVersion {
    match maybe_doc {
        Some(MaybeDocument::Document(doc)) => doc.version(),
        _ => SnapshotVersion::min(),
    }
}

fn existing_data(maybe_doc: Option<&MaybeDocument>) -> MapValue {
    match maybe_doc {
        Some(MaybeDocument::Document(doc)) => doc.data().clone(),
        _ => MapValue::empty(),
    }
}

fn require_document(maybe_doc: Option<&MaybeDocument>) -> &Document {
    match maybe_doc {
        Some(MaybeDocument::Document(doc)) => doc,
        other => fail(format!("Expected a document, found {other:?}")),
    }
}

fn patch_object(mut data: MapValue, patch: &MapValue, field_mask: &FieldMask) -> MapValue {
    for path in field_mask.fields() {
        match patch.field(path) {
            Some(value) => data.set(path, value.clone()),
            None => data.delete(path),
        }
    }
    data
}

fn transform_object(
    mut data: MapValue,
    field_transforms: &[FieldTransform],
    results: Vec<FirestoreValue>,
) -> MapValue {
    for (field_transform, value) in field_transforms.iter().zip(results) {
        data.set(&field_transform.field, value);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, TransformOperation};
    use std::collections::BTreeMap;

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

    fn doc(path: &str, version: i64, data: MapValue) -> MaybeDocument {
        Document::new(
            key(path),
            SnapshotVersion::from_seconds(version),
            data,
            DocumentState::Synced,
        )
        .into()
    }

    #[test]
    fn set_on_absent_document_uses_min_version() {
        let mutation = Mutation::set(key("c/a"), map(&[("x", FirestoreValue::from_integer(1))]));
        let result = mutation
            .apply_to_local_view(None, None, Timestamp::now())
            .unwrap();
        let doc = result.as_document().unwrap();
        assert_eq!(doc.version(), SnapshotVersion::min());
        assert!(doc.has_local_mutations());
    }

    #[test]
    fn set_keeps_existing_version() {
        let base = doc("c/a", 3, map(&[("y", FirestoreValue::from_integer(2))]));
        let mutation = Mutation::set(key("c/a"), map(&[("x", FirestoreValue::from_integer(1))]));
        let result = mutation
            .apply_to_local_view(Some(&base), Some(&base), Timestamp::now())
            .unwrap();
        let doc = result.as_document().unwrap();
        assert_eq!(doc.version(), SnapshotVersion::from_seconds(3));
        assert_eq!(doc.data(), &map(&[("x", FirestoreValue::from_integer(1))]));
    }

    #[test]
    fn patch_is_noop_against_absence() {
        let mutation = Mutation::patch(
            key("c/a"),
            map(&[("x", FirestoreValue::from_integer(1))]),
            FieldMask::from_paths([field("x")]),
        );
        assert_eq!(mutation.apply_to_local_view(None, None, Timestamp::now()), None);

        let deleted: MaybeDocument =
            NoDocument::new(key("c/a"), SnapshotVersion::from_seconds(2), false).into();
        assert_eq!(
            mutation.apply_to_local_view(Some(&deleted), None, Timestamp::now()),
            Some(deleted.clone())
        );
    }

    #[test]
    fn patch_applies_field_mask() {
        let base = doc(
            "c/a",
            1,
            map(&[
                ("keep", FirestoreValue::from_integer(1)),
                ("drop", FirestoreValue::from_integer(2)),
                ("over", FirestoreValue::from_integer(3)),
            ]),
        );
        let mutation = Mutation::patch(
            key("c/a"),
            map(&[("over", FirestoreValue::from_integer(30))]),
            FieldMask::from_paths([field("drop"), field("over")]),
        );
        let result = mutation
            .apply_to_local_view(Some(&base), Some(&base), Timestamp::now())
            .unwrap();
        assert_eq!(
            result.as_document().unwrap().data(),
            &map(&[
                ("keep", FirestoreValue::from_integer(1)),
                ("over", FirestoreValue::from_integer(30)),
            ])
        );
        assert_eq!(result.version(), SnapshotVersion::from_seconds(1));
    }

    #[test]
    fn patch_is_idempotent() {
        let base = doc("c/a", 1, map(&[("a", FirestoreValue::from_integer(1))]));
        let mutation = Mutation::patch(
            key("c/a"),
            map(&[("b.c", FirestoreValue::from_integer(2))]),
            FieldMask::from_paths([field("b.c")]),
        );
        let now = Timestamp::now();
        let once = mutation.apply_to_local_view(Some(&base), Some(&base), now);
        let twice = mutation.apply_to_local_view(once.as_ref(), Some(&base), now);
        assert_eq!(once, twice);
    }

    #[test]
    fn delete_always_produces_min_version_tombstone() {
        let base = doc("c/a", 4, MapValue::empty());
        let result = Mutation::delete(key("c/a"))
            .apply_to_local_view(Some(&base), Some(&base), Timestamp::now())
            .unwrap();
        assert_eq!(
            result,
            NoDocument::new(key("c/a"), SnapshotVersion::min(), false).into()
        );
    }

    #[test]
    fn transform_requires_existing_document() {
        let mutation = Mutation::transform(
            key("c/a"),
            vec![FieldTransform::new(
                field("count"),
                TransformOperation::numeric_increment(FirestoreValue::from_integer(1)).unwrap(),
            )],
        );
        assert_eq!(mutation.apply_to_local_view(None, None, Timestamp::now()), None);

        let base = doc("c/a", 1, map(&[("count", FirestoreValue::from_integer(5))]));
        let result = mutation
            .apply_to_local_view(Some(&base), Some(&base), Timestamp::now())
            .unwrap();
        assert_eq!(
            result.as_document().unwrap().field(&field("count")),
            Some(&FirestoreValue::from_integer(6))
        );
    }

    #[test]
    fn remote_results_mark_committed_mutations() {
        let mutation = Mutation::set(key("c/a"), map(&[("x", FirestoreValue::from_integer(1))]));
        let result = mutation
            .apply_to_remote_document(None, &MutationResult::new(SnapshotVersion::from_seconds(5), None))
            .unwrap();
        let doc = result.as_document().unwrap();
        assert_eq!(doc.version(), SnapshotVersion::from_seconds(5));
        assert!(doc.has_committed_mutations());

        let deleted = Mutation::delete(key("c/a"))
            .apply_to_remote_document(
                Some(&result),
                &MutationResult::new(SnapshotVersion::from_seconds(6), None),
            )
            .unwrap();
        assert!(deleted.has_pending_writes());
        assert_eq!(deleted.version(), SnapshotVersion::from_seconds(6));
    }

    #[test]
    fn acknowledged_patch_merges_into_cached_document() {
        let base = doc(
            "c/a",
            1,
            map(&[
                ("keep", FirestoreValue::from_integer(1)),
                ("over", FirestoreValue::from_integer(2)),
            ]),
        );
        let mutation = Mutation::patch(
            key("c/a"),
            map(&[("over", FirestoreValue::from_integer(20))]),
            FieldMask::from_paths([field("over")]),
        );
        let result = mutation
            .apply_to_remote_document(Some(&base), &MutationResult::new(SnapshotVersion::from_seconds(4), None))
            .unwrap();
        let doc = result.as_document().unwrap();
        assert_eq!(doc.version(), SnapshotVersion::from_seconds(4));
        assert!(doc.has_committed_mutations());
        assert_eq!(
            doc.data(),
            &map(&[
                ("keep", FirestoreValue::from_integer(1)),
                ("over", FirestoreValue::from_integer(20)),
            ])
        );
    }

    #[test]
    fn failed_remote_patch_yields_unknown_document() {
        let mutation = Mutation::patch(
            key("c/a"),
            map(&[("x", FirestoreValue::from_integer(1))]),
            FieldMask::from_paths([field("x")]),
        );
        let result = mutation
            .apply_to_remote_document(None, &MutationResult::new(SnapshotVersion::from_seconds(7), None))
            .unwrap();
        assert_eq!(
            result,
            UnknownDocument::new(key("c/a"), SnapshotVersion::from_seconds(7)).into()
        );
    }

    #[test]
    fn remote_transform_uses_server_values() {
        let base = doc("c/a", 1, map(&[("count", FirestoreValue::from_integer(5))]));
        let mutation = Mutation::transform(
            key("c/a"),
            vec![FieldTransform::new(
                field("count"),
                TransformOperation::numeric_increment(FirestoreValue::from_integer(1)).unwrap(),
            )],
        );
        let result = mutation
            .apply_to_remote_document(
                Some(&base),
                &MutationResult::new(
                    SnapshotVersion::from_seconds(2),
                    Some(vec![FirestoreValue::from_integer(100)]),
                ),
            )
            .unwrap();
        assert_eq!(
            result.as_document().unwrap().field(&field("count")),
            Some(&FirestoreValue::from_integer(100))
        );
    }

    #[test]
    fn extracts_base_value_for_increment_only() {
        let base = doc("c/a", 1, map(&[("count", FirestoreValue::from_integer(5))]));
        let mutation = Mutation::transform(
            key("c/a"),
            vec![
                FieldTransform::new(
                    field("count"),
                    TransformOperation::numeric_increment(FirestoreValue::from_integer(1)).unwrap(),
                ),
                FieldTransform::new(field("at"), TransformOperation::ServerTimestamp),
            ],
        );
        let base_value = mutation.extract_base_value(Some(&base)).unwrap();
        let mut expected = BTreeMap::new();
        expected.insert("count".to_string(), FirestoreValue::from_integer(5));
        assert_eq!(base_value, MapValue::new(expected));

        let set = Mutation::set(key("c/a"), MapValue::empty());
        assert_eq!(set.extract_base_value(Some(&base)), None);
    }

    #[test]
    fn preconditions() {
        let existing = doc("c/a", 3, MapValue::empty());
        let missing: MaybeDocument =
            NoDocument::new(key("c/a"), SnapshotVersion::from_seconds(1), false).into();
        assert!(Precondition::Exists(true).is_valid_for(Some(&existing)));
        assert!(!Precondition::Exists(true).is_valid_for(Some(&missing)));
        assert!(Precondition::Exists(false).is_valid_for(None));
        assert!(Precondition::UpdateTime(SnapshotVersion::from_seconds(3)).is_valid_for(Some(&existing)));
        assert!(!Precondition::UpdateTime(SnapshotVersion::from_seconds(2)).is_valid_for(Some(&existing)));
    }
}
