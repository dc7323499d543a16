use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::model::{FieldMask, FieldPath};
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Map of field names to values. Also serves as the data of a document.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Reads the value stored at `path`, descending through nested maps.
    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let mut current = self;
        let segments = path.segments();
        for (index, segment) in segments.iter().enumerate() {
            let value = current.fields.get(segment)?;
            if index == segments.len() - 1 {
                return Some(value);
            }
            current = value.as_map()?;
        }
        None
    }

    /// Writes `value` at `path`, replacing non-map intermediates with maps.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        let segments = path.segments();
        if segments.is_empty() {
            return;
        }
        set_in(&mut self.fields, segments, value);
    }

    /// Removes the value at `path`. Missing parents leave the map untouched.
    pub fn delete(&mut self, path: &FieldPath) {
        let segments = path.segments();
        if segments.is_empty() {
            return;
        }
        delete_in(&mut self.fields, segments);
    }

    /// Every leaf path in this map. Empty nested maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut fields = BTreeSet::new();
        collect_leaf_paths(&self.fields, &[], &mut fields);
        FieldMask::new(fields)
    }
}

fn set_in(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String], value: FirestoreValue) {
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };
    if rest.is_empty() {
        fields.insert(head.clone(), value);
        return;
    }

    let mut nested = match fields.remove(head) {
        Some(existing) => match existing.kind() {
            ValueKind::Map(map) => map.fields().clone(),
            _ => BTreeMap::new(),
        },
        None => BTreeMap::new(),
    };
    set_in(&mut nested, rest, value);
    fields.insert(head.clone(), FirestoreValue::from_map(nested));
}

fn delete_in(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };
    if rest.is_empty() {
        fields.remove(head);
        return;
    }

    let Some(existing) = fields.get(head) else {
        return;
    };
    let Some(map) = existing.as_map() else {
        return;
    };
    let mut nested = map.fields().clone();
    delete_in(&mut nested, rest);
    fields.insert(head.clone(), FirestoreValue::from_map(nested));
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &[String],
    out: &mut BTreeSet<FieldPath>,
) {
    for (key, value) in fields {
        let mut segments = prefix.to_vec();
        segments.push(key.clone());
        match value.as_map() {
            Some(map) if !map.is_empty() => collect_leaf_paths(map.fields(), &segments, out),
            _ => {
                if let Ok(path) = FieldPath::new(segments) {
                    out.insert(path);
                }
            }
        }
    }
}
