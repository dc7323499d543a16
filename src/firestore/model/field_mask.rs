use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::model::FieldPath;

/// Set of field paths touched by a patch.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new(fields: BTreeSet<FieldPath>) -> Self {
        Self { fields }
    }

    pub fn from_paths<I: IntoIterator<Item = FieldPath>>(paths: I) -> Self {
        Self::new(paths.into_iter().collect())
    }

    pub fn fields(&self) -> &BTreeSet<FieldPath> {
        &self.fields
    }

    /// True when `path` equals or is nested under one of the mask's paths.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }
}
