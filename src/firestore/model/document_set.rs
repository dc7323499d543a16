use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::firestore::model::{Document, DocumentKey};

pub type DocumentComparator = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

/// Documents kept sorted by a query comparator, with the key as final tie-break.
/// Each key appears at most once.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, Document>,
    sorted: Vec<Document>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    /// Set ordered by key only.
    pub fn key_ordered() -> Self {
        Self::new(Arc::new(|_: &Document, _: &Document| Ordering::Equal))
    }

    pub fn comparator(&self) -> DocumentComparator {
        self.comparator.clone()
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn has(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let doc = self.by_key.get(key)?;
        self.position(doc).ok()
    }

    /// Inserts or replaces the document with the same key.
    pub fn add(&mut self, doc: Document) {
        self.delete(doc.key());
        let index = match self.position(&doc) {
            Ok(index) | Err(index) => index,
        };
        self.by_key.insert(doc.key().clone(), doc.clone());
        self.sorted.insert(index, doc);
    }

    pub fn delete(&mut self, key: &DocumentKey) -> Option<Document> {
        let existing = self.by_key.remove(key)?;
        if let Ok(index) = self.position(&existing) {
            self.sorted.remove(index);
        }
        Some(existing)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(Document::key)
    }

    fn position(&self, doc: &Document) -> Result<usize, usize> {
        self.sorted
            .binary_search_by(|probe| self.compare(probe, doc))
    }

    fn compare(&self, left: &Document, right: &Document) -> Ordering {
        (self.comparator)(left, right).then_with(|| left.key().cmp(right.key()))
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.sorted.iter().map(|doc| doc.key().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DocumentState, FieldPath, SnapshotVersion};
    use crate::firestore::value::{value_compare, FirestoreValue, MapValue};

    fn doc(path: &str, sort: i64) -> Document {
        let mut data = MapValue::empty();
        data.set(
            &FieldPath::from_dot_separated("sort").unwrap(),
            FirestoreValue::from_integer(sort),
        );
        Document::new(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_seconds(1),
            data,
            DocumentState::Synced,
        )
    }

    fn by_sort() -> DocumentComparator {
        let field = FieldPath::from_dot_separated("sort").unwrap();
        Arc::new(move |left: &Document, right: &Document| {
            match (left.field(&field), right.field(&field)) {
                (Some(l), Some(r)) => value_compare(l, r),
                _ => Ordering::Equal,
            }
        })
    }

    #[test]
    fn keeps_documents_sorted() {
        let mut set = DocumentSet::new(by_sort());
        set.add(doc("c/a", 3));
        set.add(doc("c/b", 1));
        set.add(doc("c/c", 2));
        let keys: Vec<String> = set.keys().map(ToString::to_string).collect();
        assert_eq!(keys, vec!["c/b", "c/c", "c/a"]);
        assert_eq!(set.index_of(&DocumentKey::from_string("c/c").unwrap()), Some(1));
    }

    #[test]
    fn replaces_existing_key() {
        let mut set = DocumentSet::new(by_sort());
        set.add(doc("c/a", 3));
        set.add(doc("c/b", 1));
        set.add(doc("c/a", 0));
        assert_eq!(set.len(), 2);
        assert_eq!(set.first().unwrap().key().id(), "a");
    }

    #[test]
    fn ties_break_by_key() {
        let mut set = DocumentSet::new(by_sort());
        set.add(doc("c/b", 1));
        set.add(doc("c/a", 1));
        assert_eq!(set.first().unwrap().key().id(), "a");
        set.delete(&DocumentKey::from_string("c/a").unwrap());
        assert_eq!(set.len(), 1);
        assert!(!set.has(&DocumentKey::from_string("c/a").unwrap()));
    }
}
