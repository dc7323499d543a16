use serde::{Deserialize, Serialize};

use crate::firestore::value::{value_equals, FirestoreValue};

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<FirestoreValue> {
        self.values
    }

    /// Membership under backend equality: NaN equals NaN, but integer `1`
    /// and double `1.0` differ.
    pub fn contains(&self, needle: &FirestoreValue) -> bool {
        self.values.iter().any(|value| value_equals(value, needle))
    }

    pub fn contains_any(&self, candidates: &ArrayValue) -> bool {
        self.values.iter().any(|value| candidates.contains(value))
    }
}
