use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{FieldPath, Timestamp};
use crate::firestore::value::{array_contains, server_timestamp_value, FirestoreValue, ValueKind};

/// Field-level transform applied as part of a transform mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    pub fn numeric_increment(operand: FirestoreValue) -> FirestoreResult<Self> {
        if !operand.is_number() {
            return Err(invalid_argument(
                "FieldValue.increment() requires a numeric operand",
            ));
        }
        Ok(TransformOperation::NumericIncrement(operand))
    }

    /// Result of the transform as seen before the backend has applied it.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => {
                server_timestamp_value(local_write_time, previous)
            }
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => {
                let base = self
                    .compute_base_value(previous)
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                add_numbers(&base, operand)
            }
        }
    }

    /// Result of the transform once the backend reported `transform_result`.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        transform_result: FirestoreValue,
    ) -> FirestoreValue {
        match self {
            // Array edits are idempotent, so the local computation is authoritative.
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::ServerTimestamp | TransformOperation::NumericIncrement(_) => {
                transform_result
            }
        }
    }

    /// Value to persist alongside the mutation so replays stay deterministic.
    ///
    /// Only non-idempotent transforms produce one.
    pub fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => Some(match previous {
                Some(value) if value.is_number() => value.clone(),
                _ => FirestoreValue::from_integer(0),
            }),
            _ => None,
        }
    }

    pub fn is_idempotent(&self) -> bool {
        !matches!(self, TransformOperation::NumericIncrement(_))
    }
}

/// A transform bound to the field it applies to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub transform: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, transform: TransformOperation) -> Self {
        Self { field, transform }
    }
}

fn coerced_elements(previous: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    match previous.and_then(FirestoreValue::as_array) {
        Some(array) => array.values().to_vec(),
        None => Vec::new(),
    }
}

fn array_union(previous: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = coerced_elements(previous);
    for element in additions {
        if !array_contains(&values, element) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(previous: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let mut values = coerced_elements(previous);
    values.retain(|value| !array_contains(removals, value));
    FirestoreValue::from_array(values)
}

/// Integer plus integer stays integer. Overflow past the 64-bit range is not
/// clamped the way the backend does; the sum falls back to a double instead.
fn add_numbers(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => match current.checked_add(*delta)
        {
            Some(sum) => FirestoreValue::from_integer(sum),
            None => FirestoreValue::from_double(*current as f64 + *delta as f64),
        },
        _ => {
            let current = base.as_f64().unwrap_or(0.0);
            let delta = operand.as_f64().unwrap_or(0.0);
            FirestoreValue::from_double(current + delta)
        }
    }
}
