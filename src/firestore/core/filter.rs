use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::model::{Document, FieldPath};
use crate::firestore::value::{type_order, value_compare, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    In,
    ArrayContainsAny,
    NotIn,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::ArrayContains => "array-contains",
            Operator::In => "in",
            Operator::ArrayContainsAny => "array-contains-any",
            Operator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositeOperator {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: FieldPath,
    pub op: Operator,
    pub value: FirestoreValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompositeFilter {
    pub op: CompositeOperator,
    pub filters: Vec<Filter>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Field(FieldFilter),
    Composite(CompositeFilter),
}

impl Filter {
    pub fn field(field: FieldPath, op: Operator, value: FirestoreValue) -> Self {
        Filter::Field(FieldFilter { field, op, value })
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter {
            op: CompositeOperator::And,
            filters,
        })
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter {
            op: CompositeOperator::Or,
            filters,
        })
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::Field(filter) => field_filter_matches(filter, doc),
            Filter::Composite(composite) => match composite.op {
                CompositeOperator::And => composite.filters.iter().all(|f| f.matches(doc)),
                CompositeOperator::Or => composite.filters.iter().any(|f| f.matches(doc)),
            },
        }
    }

    /// First field constrained by an inequality, searching nested filters too.
    pub fn first_inequality_field(&self) -> Option<&FieldPath> {
        match self {
            Filter::Field(filter) if filter.op.is_inequality() => Some(&filter.field),
            Filter::Field(_) => None,
            Filter::Composite(composite) => composite
                .filters
                .iter()
                .find_map(Filter::first_inequality_field),
        }
    }
}

fn field_filter_matches(filter: &FieldFilter, doc: &Document) -> bool {
    let key_value;
    let other = if filter.field.is_key_field() {
        key_value = FirestoreValue::from_reference(doc.key().path().canonical_string());
        Some(&key_value)
    } else {
        doc.field(&filter.field)
    };

    match filter.op {
        Operator::ArrayContains => match other.and_then(FirestoreValue::as_array) {
            Some(array) => array.contains(&filter.value),
            None => false,
        },
        Operator::ArrayContainsAny => {
            let (Some(array), Some(candidates)) = (
                other.and_then(FirestoreValue::as_array),
                filter.value.as_array(),
            ) else {
                return false;
            };
            array.contains_any(candidates)
        }
        Operator::In => match (other, filter.value.as_array()) {
            (Some(other), Some(candidates)) => candidates.contains(other),
            _ => false,
        },
        Operator::NotIn => {
            let Some(candidates) = filter.value.as_array() else {
                return false;
            };
            if candidates.contains(&FirestoreValue::null()) {
                return false;
            }
            match other {
                Some(other) => !candidates.contains(other),
                None => false,
            }
        }
        Operator::NotEqual => match other {
            Some(other) => value_compare(other, &filter.value) != std::cmp::Ordering::Equal,
            None => false,
        },
        Operator::Equal
        | Operator::LessThan
        | Operator::LessThanOrEqual
        | Operator::GreaterThan
        | Operator::GreaterThanOrEqual => {
            let Some(other) = other else {
                return false;
            };
            if type_order(other) != type_order(&filter.value) {
                return false;
            }
            // NaN only matches equality against NaN.
            if matches!(other.kind(), ValueKind::Double(v) if v.is_nan())
                != matches!(filter.value.kind(), ValueKind::Double(v) if v.is_nan())
                && filter.op != Operator::Equal
            {
                return false;
            }
            let ordering = value_compare(other, &filter.value);
            match filter.op {
                Operator::Equal => ordering.is_eq(),
                Operator::LessThan => ordering.is_lt(),
                Operator::LessThanOrEqual => ordering.is_le(),
                Operator::GreaterThan => ordering.is_gt(),
                Operator::GreaterThanOrEqual => ordering.is_ge(),
                _ => false,
            }
        }
    }
}

impl Display for Filter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Filter::Field(filter) => write!(
                f,
                "{}{}{}",
                filter.field.canonical_string(),
                filter.op.as_str(),
                filter.value
            ),
            Filter::Composite(composite) => {
                let op = match composite.op {
                    CompositeOperator::And => "and",
                    CompositeOperator::Or => "or",
                };
                write!(f, "{op}(")?;
                for (index, filter) in composite.filters.iter().enumerate() {
                    if index > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{filter}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DocumentKey, DocumentState, SnapshotVersion};
    use crate::firestore::value::MapValue;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn doc(path: &str, entries: &[(&str, FirestoreValue)]) -> Document {
        let mut data = MapValue::empty();
        for (name, value) in entries {
            data.set(&field(name), value.clone());
        }
        Document::new(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_seconds(1),
            data,
            DocumentState::Synced,
        )
    }

    #[test]
    fn comparison_filters_require_matching_types() {
        let d = doc("c/a", &[("n", FirestoreValue::from_integer(5))]);
        assert!(Filter::field(field("n"), Operator::GreaterThan, FirestoreValue::from_double(4.5)).matches(&d));
        assert!(!Filter::field(field("n"), Operator::GreaterThan, FirestoreValue::from_string("a")).matches(&d));
        assert!(!Filter::field(field("missing"), Operator::Equal, FirestoreValue::null()).matches(&d));
    }

    #[test]
    fn array_membership_filters() {
        let d = doc(
            "c/a",
            &[(
                "tags",
                FirestoreValue::from_array(vec![
                    FirestoreValue::from_string("x"),
                    FirestoreValue::from_string("y"),
                ]),
            )],
        );
        assert!(Filter::field(field("tags"), Operator::ArrayContains, FirestoreValue::from_string("y")).matches(&d));
        assert!(Filter::field(
            field("tags"),
            Operator::ArrayContainsAny,
            FirestoreValue::from_array(vec![FirestoreValue::from_string("z"), FirestoreValue::from_string("x")])
        )
        .matches(&d));
    }

    #[test]
    fn in_and_not_in() {
        let d = doc("c/a", &[("n", FirestoreValue::from_integer(2))]);
        let candidates = FirestoreValue::from_array(vec![
            FirestoreValue::from_integer(1),
            FirestoreValue::from_integer(2),
        ]);
        assert!(Filter::field(field("n"), Operator::In, candidates.clone()).matches(&d));
        assert!(!Filter::field(field("n"), Operator::NotIn, candidates).matches(&d));
        let with_null = FirestoreValue::from_array(vec![FirestoreValue::null()]);
        assert!(!Filter::field(field("n"), Operator::NotIn, with_null).matches(&d));
    }

    #[test]
    fn key_field_filters_compare_paths() {
        let d = doc("c/b", &[]);
        assert!(Filter::field(FieldPath::key_path(), Operator::GreaterThan, FirestoreValue::from_reference("c/a")).matches(&d));
        assert!(!Filter::field(FieldPath::key_path(), Operator::Equal, FirestoreValue::from_reference("c/a")).matches(&d));
    }

    #[test]
    fn composite_filters() {
        let d = doc("c/a", &[("n", FirestoreValue::from_integer(2))]);
        let low = Filter::field(field("n"), Operator::LessThan, FirestoreValue::from_integer(1));
        let high = Filter::field(field("n"), Operator::GreaterThan, FirestoreValue::from_integer(1));
        assert!(Filter::or(vec![low.clone(), high.clone()]).matches(&d));
        assert!(!Filter::and(vec![low, high]).matches(&d));
    }
}
