//! Snapshot normalization
//!
//! Two snapshots of the same resource differ constantly in fields nobody
//! cares about (timestamps, resource versions, managed fields). Scrubbing
//! removes them so change detection only fires on meaningful updates.

use serde_json::{Map, Value};

/// Member names removed by [`scrub_volatile`]
const VOLATILE_FIELDS: &[&str] = &[
    "annotations",
    "uid",
    "conditions",
    "resourceVersion",
    "managedFields",
];

/// Whether a member name holds data that changes without a real update.
///
/// Any name containing `Time` (`creationTimestamp`, `lastUpdateTime`,
/// `startTime`, ...) plus a fixed set of bookkeeping fields.
pub fn is_volatile_field(name: &str) -> bool {
    name.contains("Time") || VOLATILE_FIELDS.contains(&name)
}

/// Remove every object member whose name matches `predicate`, recursively.
pub fn scrub_json(value: &Value, predicate: &dyn Fn(&str) -> bool) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !predicate(key))
                .map(|(key, v)| (key.clone(), scrub_json(v, predicate)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| scrub_json(v, predicate)).collect())
        }
        other => other.clone(),
    }
}

/// Scrub with [`is_volatile_field`]
pub fn scrub_volatile(value: &Value) -> Value {
    scrub_json(value, &is_volatile_field)
}
