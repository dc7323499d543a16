use std::cmp::Ordering;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::firestore::core::filter::Filter;
use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::firestore::value::{value_compare, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn flipped(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn ascending(field: FieldPath) -> Self {
        Self::new(field, Direction::Ascending)
    }

    pub fn descending(field: FieldPath) -> Self {
        Self::new(field, Direction::Descending)
    }

    /// Orders two documents by this component only.
    ///
    /// Both documents must contain the field unless it is the key field.
    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => value_compare(l, r),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

/// A query cursor. `inclusive` means the document at `position` is part of
/// the result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub position: Vec<FirestoreValue>,
    pub inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self { position, inclusive }
    }

    /// Compares the bound's position with `doc` along `order_by`.
    fn compare_to_document(&self, order_by: &[OrderBy], doc: &Document) -> Ordering {
        for (component, value) in order_by.iter().zip(&self.position) {
            let ordering = if component.field.is_key_field() {
                match value.kind() {
                    ValueKind::Reference(path) => match DocumentKey::from_string(path) {
                        Ok(key) => key.cmp(doc.key()),
                        Err(_) => Ordering::Less,
                    },
                    _ => Ordering::Less,
                }
            } else {
                match doc.field(&component.field) {
                    Some(doc_value) => value_compare(value, doc_value),
                    None => Ordering::Less,
                }
            };
            let ordering = match component.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// True if `doc` is at or after this bound when used as a start cursor.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, doc);
        if self.inclusive {
            ordering.is_le()
        } else {
            ordering.is_lt()
        }
    }

    /// True if `doc` is at or before this bound when used as an end cursor.
    pub fn sorts_after_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, doc);
        if self.inclusive {
            ordering.is_ge()
        } else {
            ordering.is_gt()
        }
    }

    fn canonical_string(&self) -> String {
        let mut out = String::from(if self.inclusive { "b:" } else { "a:" });
        for (index, value) in self.position.iter().enumerate() {
            if index > 0 {
                out.push(',');
            }
            let _ = write!(out, "{value}");
        }
        out
    }
}

/// The normalized shape of a query as the watch stream sees it.
///
/// Unlike a `Query`, a target carries its order exactly as given; the key
/// tie-break has already been appended by `Query::to_target`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    /// Target for a single document lookup.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self {
            path: key.path().clone(),
            collection_group: None,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    /// String that is equal for equal targets. Used as a lookup key.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            let _ = write!(id, "|cg:{group}");
        }
        id.push_str("|f:");
        for filter in &self.filters {
            let _ = write!(id, "{filter}");
        }
        id.push_str("|ob:");
        for order_by in &self.order_by {
            let direction = match order_by.direction {
                Direction::Ascending => "asc",
                Direction::Descending => "desc",
            };
            let _ = write!(id, "{}{}", order_by.field.canonical_string(), direction);
        }
        if let Some(limit) = self.limit {
            let _ = write!(id, "|l:{limit}");
        }
        if let Some(start) = &self.start_at {
            let _ = write!(id, "|lb:{}", start.canonical_string());
        }
        if let Some(end) = &self.end_at {
            let _ = write!(id, "|ub:{}", end.canonical_string());
        }
        id
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_id() == other.canonical_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::filter::Operator;

    #[test]
    fn canonical_id_distinguishes_targets() {
        let base = Target {
            path: ResourcePath::from_string("rooms").unwrap(),
            collection_group: None,
            filters: vec![Filter::field(
                FieldPath::from_dot_separated("size").unwrap(),
                Operator::Equal,
                FirestoreValue::from_integer(1),
            )],
            order_by: vec![OrderBy::ascending(FieldPath::key_path())],
            limit: None,
            start_at: None,
            end_at: None,
        };
        let mut limited = base.clone();
        limited.limit = Some(2);
        let mut double = base.clone();
        double.filters = vec![Filter::field(
            FieldPath::from_dot_separated("size").unwrap(),
            Operator::Equal,
            FirestoreValue::from_double(1.0),
        )];

        assert_eq!(base.canonical_id(), "rooms|f:size==1|ob:__name__asc");
        assert_ne!(base, limited);
        assert_ne!(base, double);
        assert_eq!(base, base.clone());
    }

    #[test]
    fn document_targets() {
        let key = DocumentKey::from_string("rooms/eros").unwrap();
        assert!(Target::for_document(&key).is_document_target());
    }
}
