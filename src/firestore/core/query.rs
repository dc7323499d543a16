use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::firestore::core::filter::Filter;
use crate::firestore::core::target::{Bound, Direction, OrderBy, Target};
use crate::firestore::model::{Document, DocumentComparator, DocumentKey, FieldPath, ResourcePath};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitType {
    First,
    Last,
}

/// A query as the user built it.
///
/// Queries always order by the document key last. Two queries that produce
/// the same [`Target`] share a watch registration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<Filter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query for the documents directly under `path`, or for the single
    /// document at `path` when it names a document.
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::at_path(key.path().clone())
    }

    /// Query over every collection with the id `collection_id` below `parent`.
    pub fn collection_group(parent: ResourcePath, collection_id: impl Into<String>) -> Self {
        let mut query = Self::at_path(parent);
        query.collection_group = Some(collection_id.into());
        query
    }

    /// Rebuilds a limit-to-first query from a persisted target, for clients
    /// that only know a target by its id.
    pub fn from_target(target: &Target) -> Self {
        Self {
            path: target.path.clone(),
            collection_group: target.collection_group.clone(),
            filters: target.filters.clone(),
            explicit_order_by: target.order_by.clone(),
            limit: target.limit,
            limit_type: LimitType::First,
            start_at: target.start_at.clone(),
            end_at: target.end_at.clone(),
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn with_start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn with_end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit_to_first(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::First
    }

    pub fn has_limit_to_last(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::Last
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True if the query returns every document of its collection unchanged.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field.is_key_field()))
    }

    pub fn inequality_field(&self) -> Option<&FieldPath> {
        self.filters.iter().find_map(Filter::first_inequality_field)
    }

    /// Order-by list with the implicit components filled in.
    ///
    /// An inequality field with no explicit order becomes the first order-by.
    /// The key is always the final component, in the direction of the last
    /// explicit component.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        if self.explicit_order_by.is_empty() {
            if let Some(field) = self.inequality_field() {
                if field.is_key_field() {
                    return vec![OrderBy::ascending(FieldPath::key_path())];
                }
                return vec![
                    OrderBy::ascending(field.clone()),
                    OrderBy::ascending(FieldPath::key_path()),
                ];
            }
        }

        let mut order_by = self.explicit_order_by.clone();
        if !order_by.iter().any(|o| o.field.is_key_field()) {
            let direction = order_by
                .last()
                .map(|o| o.direction)
                .unwrap_or(Direction::Ascending);
            order_by.push(OrderBy::new(FieldPath::key_path(), direction));
        }
        order_by
    }

    /// Converts to the target sent to the backend. Limit-to-last queries are
    /// sent with every direction flipped and their cursors swapped.
    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by,
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by: order_by
                    .into_iter()
                    .map(|o| OrderBy::new(o.field, o.direction.flipped()))
                    .collect(),
                limit: self.limit,
                start_at: self.end_at.clone(),
                end_at: self.start_at.clone(),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        let target = self.to_target();
        let suffix = match self.limit_type {
            LimitType::First => "|lt:f",
            LimitType::Last => "|lt:l",
        };
        format!("{}{}", target.canonical_id(), suffix)
    }

    /// True if `doc` belongs to the result of this query, ignoring the limit.
    pub fn matches(&self, doc: &Document) -> bool {
        self.matches_path_and_collection_group(doc.key())
            && self.matches_order_by(doc)
            && self.filters.iter().all(|filter| filter.matches(doc))
            && self.matches_bounds(doc)
    }

    fn matches_path_and_collection_group(&self, key: &DocumentKey) -> bool {
        let doc_path = key.path();
        if let Some(group) = &self.collection_group {
            key.collection_group() == group && self.path.is_prefix_of(doc_path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == doc_path
        } else {
            self.path.is_immediate_parent_of(doc_path)
        }
    }

    fn matches_order_by(&self, doc: &Document) -> bool {
        self.explicit_order_by
            .iter()
            .all(|o| o.field.is_key_field() || doc.field(&o.field).is_some())
    }

    fn matches_bounds(&self, doc: &Document) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, doc) {
                return false;
            }
        }
        true
    }

    /// Comparator for documents in this query's result order.
    pub fn comparator(&self) -> DocumentComparator {
        let order_by = self.normalized_order_by();
        Arc::new(move |left: &Document, right: &Document| {
            for component in &order_by {
                let ordering = component.compare(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        })
    }

    /// Filters, sorts and limits a candidate set.
    pub fn apply_to_documents<I>(&self, documents: I) -> Vec<Document>
    where
        I: IntoIterator<Item = Document>,
    {
        let comparator = self.comparator();
        let mut results: Vec<Document> = documents
            .into_iter()
            .filter(|doc| self.matches(doc))
            .collect();
        results.sort_by(|left, right| comparator(left, right));
        if let Some(limit) = self.limit {
            let limit = limit as usize;
            if results.len() > limit {
                match self.limit_type {
                    LimitType::First => results.truncate(limit),
                    LimitType::Last => {
                        results.drain(0..results.len() - limit);
                    }
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::filter::Operator;
    use crate::firestore::model::{DocumentState, SnapshotVersion};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn doc(path: &str, sort: i64) -> Document {
        let mut data = MapValue::empty();
        data.set(&field("sort"), FirestoreValue::from_integer(sort));
        Document::new(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_seconds(1),
            data,
            DocumentState::Synced,
        )
    }

    fn collection(path: &str) -> Query {
        Query::at_path(ResourcePath::from_string(path).unwrap())
    }

    #[test]
    fn matches_only_direct_children() {
        let query = collection("rooms");
        assert!(query.matches(&doc("rooms/a", 1)));
        assert!(!query.matches(&doc("rooms/a/messages/b", 1)));
        assert!(!query.matches(&doc("other/a", 1)));
    }

    #[test]
    fn collection_group_matches_nested() {
        let query = Query::collection_group(ResourcePath::root(), "messages");
        assert!(query.matches(&doc("rooms/a/messages/b", 1)));
        assert!(!query.matches(&doc("rooms/a", 1)));
    }

    #[test]
    fn documents_missing_order_field_are_excluded() {
        let query = collection("rooms").with_order_by(OrderBy::ascending(field("missing")));
        assert!(!query.matches(&doc("rooms/a", 1)));
    }

    #[test]
    fn normalized_order_by_appends_key() {
        let query = collection("rooms").with_order_by(OrderBy::descending(field("sort")));
        let order_by = query.normalized_order_by();
        assert_eq!(order_by.len(), 2);
        assert!(order_by[1].field.is_key_field());
        assert_eq!(order_by[1].direction, Direction::Descending);

        let inequality = collection("rooms").with_filter(Filter::field(
            field("sort"),
            Operator::GreaterThan,
            FirestoreValue::from_integer(0),
        ));
        assert_eq!(inequality.normalized_order_by()[0].field, field("sort"));
    }

    #[test]
    fn limit_to_last_flips_target() {
        let query = collection("rooms")
            .with_order_by(OrderBy::ascending(field("sort")))
            .with_start_at(Bound::new(vec![FirestoreValue::from_integer(1)], true))
            .with_limit_to_last(2);
        let target = query.to_target();
        assert!(target
            .order_by
            .iter()
            .all(|o| o.direction == Direction::Descending));
        assert!(target.start_at.is_none());
        assert!(target.end_at.is_some());
        assert_ne!(
            query.canonical_id(),
            query.clone().with_limit_to_first(2).canonical_id()
        );
    }

    #[test]
    fn applies_bounds_and_limits() {
        let docs = vec![doc("rooms/a", 1), doc("rooms/b", 2), doc("rooms/c", 3), doc("rooms/d", 4)];
        let query = collection("rooms")
            .with_order_by(OrderBy::ascending(field("sort")))
            .with_start_at(Bound::new(vec![FirestoreValue::from_integer(2)], false));
        let keys: Vec<String> = query
            .apply_to_documents(docs.clone())
            .iter()
            .map(|d| d.key().id().to_string())
            .collect();
        assert_eq!(keys, vec!["c", "d"]);

        let last = collection("rooms")
            .with_order_by(OrderBy::ascending(field("sort")))
            .with_limit_to_last(2);
        let keys: Vec<String> = last
            .apply_to_documents(docs)
            .iter()
            .map(|d| d.key().id().to_string())
            .collect();
        assert_eq!(keys, vec!["c", "d"]);
    }

    #[test]
    fn matches_all_documents() {
        assert!(collection("rooms").matches_all_documents());
        assert!(!collection("rooms").with_limit_to_first(1).matches_all_documents());
    }
}
