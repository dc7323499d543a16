//! Backend ordering and equality semantics for values.

use std::cmp::Ordering;

use crate::firestore::value::server_timestamp::{get_local_write_time, is_server_timestamp};
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Relative order of value types, matching the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeOrder {
    Null,
    Boolean,
    Number,
    Timestamp,
    ServerTimestamp,
    String,
    Bytes,
    Reference,
    GeoPoint,
    Array,
    Map,
}

pub fn type_order(value: &FirestoreValue) -> TypeOrder {
    match value.kind() {
        ValueKind::Null => TypeOrder::Null,
        ValueKind::Boolean(_) => TypeOrder::Boolean,
        ValueKind::Integer(_) | ValueKind::Double(_) => TypeOrder::Number,
        ValueKind::Timestamp(_) => TypeOrder::Timestamp,
        ValueKind::String(_) => TypeOrder::String,
        ValueKind::Bytes(_) => TypeOrder::Bytes,
        ValueKind::Reference(_) => TypeOrder::Reference,
        ValueKind::GeoPoint(_) => TypeOrder::GeoPoint,
        ValueKind::Array(_) => TypeOrder::Array,
        ValueKind::Map(_) if is_server_timestamp(value) => TypeOrder::ServerTimestamp,
        ValueKind::Map(_) => TypeOrder::Map,
    }
}

/// Deep equality. NaN equals NaN, `0.0` and `-0.0` differ, and an integer
/// never equals a double.
pub fn value_equals(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    if type_order(left) != type_order(right) {
        return false;
    }
    match (left.kind(), right.kind()) {
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
        (ValueKind::Double(l), ValueKind::Double(r)) => {
            if l.is_nan() && r.is_nan() {
                true
            } else {
                l.to_bits() == r.to_bits() || (l == r && l.is_sign_negative() == r.is_sign_negative())
            }
        }
        (ValueKind::Integer(_), ValueKind::Double(_))
        | (ValueKind::Double(_), ValueKind::Integer(_)) => false,
        (ValueKind::Map(_), ValueKind::Map(_)) if is_server_timestamp(left) => {
            get_local_write_time(left) == get_local_write_time(right)
        }
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            l.values().len() == r.values().len()
                && l
                    .values()
                    .iter()
                    .zip(r.values())
                    .all(|(a, b)| value_equals(a, b))
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            l.fields().len() == r.fields().len()
                && l.fields().iter().all(|(key, value)| {
                    r.fields()
                        .get(key)
                        .map(|other| value_equals(value, other))
                        .unwrap_or(false)
                })
        }
        _ => value_compare(left, right) == Ordering::Equal,
    }
}

pub fn value_compare(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_type = type_order(left);
    let right_type = type_order(right);
    if left_type != right_type {
        return left_type.cmp(&right_type);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (ValueKind::Integer(_), _) | (ValueKind::Double(_), _) => {
            compare_doubles(left.as_f64().unwrap_or(f64::NAN), right.as_f64().unwrap_or(f64::NAN))
        }
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (ValueKind::String(l), ValueKind::String(r)) => l.cmp(r),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.cmp(r),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => l.split('/').cmp(r.split('/')),
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l.compare(r),
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            for (a, b) in l.values().iter().zip(r.values()) {
                let ordering = value_compare(a, b);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            l.values().len().cmp(&r.values().len())
        }
        (ValueKind::Map(_), ValueKind::Map(_)) if left_type == TypeOrder::ServerTimestamp => {
            get_local_write_time(left).cmp(&get_local_write_time(right))
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            for ((left_key, left_value), (right_key, right_value)) in
                l.fields().iter().zip(r.fields())
            {
                let ordering = left_key
                    .cmp(right_key)
                    .then_with(|| value_compare(left_value, right_value));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            l.fields().len().cmp(&r.fields().len())
        }
        _ => Ordering::Equal,
    }
}

/// NaN sorts before every other number and equals itself.
fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

pub fn array_contains(values: &[FirestoreValue], needle: &FirestoreValue) -> bool {
    values.iter().any(|value| value_equals(value, needle))
}
