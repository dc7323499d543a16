//! Local representation of a pending server timestamp.
//!
//! Until the backend assigns the real time, the local view stores a sentinel
//! map holding the local write time and the value the field had before.

use std::collections::BTreeMap;

use crate::firestore::model::Timestamp;
use crate::firestore::value::{FirestoreValue, ValueKind};

const TYPE_KEY: &str = "__type__";
const SERVER_TIMESTAMP_SENTINEL: &str = "server_timestamp";
const PREVIOUS_VALUE_KEY: &str = "__previous_value__";
const LOCAL_WRITE_TIME_KEY: &str = "__local_write_time__";

pub fn server_timestamp_value(
    local_write_time: Timestamp,
    previous_value: Option<&FirestoreValue>,
) -> FirestoreValue {
    let mut fields = BTreeMap::new();
    fields.insert(
        TYPE_KEY.to_string(),
        FirestoreValue::from_string(SERVER_TIMESTAMP_SENTINEL),
    );
    fields.insert(
        LOCAL_WRITE_TIME_KEY.to_string(),
        FirestoreValue::from_timestamp(local_write_time),
    );
    if let Some(previous) = previous_value {
        // Chains of pending server timestamps keep only the oldest real value.
        let previous = get_previous_value(previous)
            .cloned()
            .unwrap_or_else(|| previous.clone());
        if !is_server_timestamp(&previous) {
            fields.insert(PREVIOUS_VALUE_KEY.to_string(), previous);
        }
    }
    FirestoreValue::from_map(fields)
}

pub fn is_server_timestamp(value: &FirestoreValue) -> bool {
    match value.as_map() {
        Some(map) => matches!(
            map.fields().get(TYPE_KEY).map(FirestoreValue::kind),
            Some(ValueKind::String(kind)) if kind == SERVER_TIMESTAMP_SENTINEL
        ),
        None => false,
    }
}

pub fn get_local_write_time(value: &FirestoreValue) -> Option<Timestamp> {
    if !is_server_timestamp(value) {
        return None;
    }
    match value.as_map()?.fields().get(LOCAL_WRITE_TIME_KEY)?.kind() {
        ValueKind::Timestamp(timestamp) => Some(*timestamp),
        _ => None,
    }
}

pub fn get_previous_value(value: &FirestoreValue) -> Option<&FirestoreValue> {
    if !is_server_timestamp(value) {
        return None;
    }
    value.as_map()?.fields().get(PREVIOUS_VALUE_KEY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_local_write_time() {
        let now = Timestamp::new(10, 0);
        let value = server_timestamp_value(now, Some(&FirestoreValue::from_integer(3)));
        assert!(is_server_timestamp(&value));
        assert_eq!(get_local_write_time(&value), Some(now));
        assert_eq!(
            get_previous_value(&value),
            Some(&FirestoreValue::from_integer(3))
        );
    }

    #[test]
    fn nested_sentinels_keep_original_previous_value() {
        let first = server_timestamp_value(
            Timestamp::new(1, 0),
            Some(&FirestoreValue::from_string("old")),
        );
        let second = server_timestamp_value(Timestamp::new(2, 0), Some(&first));
        assert_eq!(
            get_previous_value(&second),
            Some(&FirestoreValue::from_string("old"))
        );
    }

    #[test]
    fn plain_maps_are_not_sentinels() {
        assert!(!is_server_timestamp(&FirestoreValue::from_map(BTreeMap::new())));
        assert!(!is_server_timestamp(&FirestoreValue::from_integer(1)));
    }
}
