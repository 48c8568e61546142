//! Local placeholder for a server timestamp that has not been committed.
//!
//! The placeholder is a map value carrying a type marker, the local write
//! time and the value the field held before the write. It only ever appears
//! in locally computed views.

use std::collections::BTreeMap;

use crate::model::Timestamp;
use crate::value::{FirestoreValue, ValueKind};

const TYPE_KEY: &str = "__type__";
const SERVER_TIMESTAMP_SENTINEL: &str = "server_timestamp";
const LOCAL_WRITE_TIME_KEY: &str = "__local_write_time__";
const PREVIOUS_VALUE_KEY: &str = "__previous_value__";

pub fn server_timestamp(
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
        fields.insert(PREVIOUS_VALUE_KEY.to_string(), previous.clone());
    }
    FirestoreValue::from_map(fields)
}

pub fn is_server_timestamp(value: &FirestoreValue) -> bool {
    match value.kind() {
        ValueKind::Map(map) => map
            .get(TYPE_KEY)
            .and_then(FirestoreValue::as_str)
            .map_or(false, |marker| marker == SERVER_TIMESTAMP_SENTINEL),
        _ => false,
    }
}

pub fn local_write_time(value: &FirestoreValue) -> Option<Timestamp> {
    value
        .as_map()
        .and_then(|map| map.get(LOCAL_WRITE_TIME_KEY))
        .and_then(FirestoreValue::as_timestamp)
}

/// Value the field held before the earliest pending server timestamp.
pub fn previous_value(value: &FirestoreValue) -> Option<&FirestoreValue> {
    let previous = value.as_map()?.get(PREVIOUS_VALUE_KEY)?;
    if is_server_timestamp(previous) {
        return previous_value(previous);
    }
    Some(previous)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_is_recognised() {
        let ts = Timestamp::new(10, 0);
        let value = server_timestamp(ts, None);
        assert!(is_server_timestamp(&value));
        assert_eq!(local_write_time(&value), Some(ts));
        assert!(previous_value(&value).is_none());
        assert!(!is_server_timestamp(&FirestoreValue::from_integer(1)));
    }

    #[test]
    fn previous_value_skips_nested_placeholders() {
        let original = FirestoreValue::from_string("before");
        let first = server_timestamp(Timestamp::new(1, 0), Some(&original));
        let second = server_timestamp(Timestamp::new(2, 0), Some(&first));
        assert_eq!(previous_value(&second), Some(&original));
    }
}
