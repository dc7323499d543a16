use std::collections::BTreeSet;

use crate::firestore::core::types::TargetId;
use crate::firestore::model::DocumentKey;

/// Document references held by targets or batches, indexed both ways.
///
/// Used for the documents pinned by local views and for limbo documents
/// tracked by the sync engine.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, TargetId)>,
    by_id: BTreeSet<(TargetId, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: TargetId) {
        self.by_key.insert((key.clone(), id));
        self.by_id.insert((id, key));
    }

    pub fn add_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: TargetId) {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: TargetId) {
        self.by_key.remove(&(key.clone(), id));
        self.by_id.remove(&(id, key.clone()));
    }

    pub fn remove_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: TargetId) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Removes every reference held by `id` and returns the affected keys.
    pub fn remove_references_for_id(&mut self, id: TargetId) -> BTreeSet<DocumentKey> {
        let keys = self.references_for_id(id);
        for key in &keys {
            self.remove_reference(key, id);
        }
        keys
    }

    pub fn remove_all_references(&mut self) {
        self.by_key.clear();
        self.by_id.clear();
    }

    pub fn references_for_id(&self, id: TargetId) -> BTreeSet<DocumentKey> {
        self.by_id
            .iter()
            .skip_while(|(ref_id, _)| *ref_id < id)
            .take_while(|(ref_id, _)| *ref_id == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), TargetId::MIN)..=(key.clone(), TargetId::MAX))
            .next()
            .is_some()
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.by_key.iter().map(|(key, _)| key.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn tracks_references_per_id() {
        let mut refs = ReferenceSet::new();
        refs.add_reference(key("rooms/a"), 1);
        refs.add_reference(key("rooms/b"), 1);
        refs.add_reference(key("rooms/a"), 2);

        assert!(refs.contains_key(&key("rooms/a")));
        assert_eq!(refs.references_for_id(1).len(), 2);

        let removed = refs.remove_references_for_id(1);
        assert_eq!(removed.len(), 2);
        assert!(refs.contains_key(&key("rooms/a")));
        assert!(!refs.contains_key(&key("rooms/b")));

        refs.remove_reference(&key("rooms/a"), 2);
        assert!(refs.is_empty());
    }
}
