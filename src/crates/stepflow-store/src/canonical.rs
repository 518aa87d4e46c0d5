//! Canonical serialization and etag computation (spec §4.4).
//!
//! The etag is a deterministic hash of the canonical serialization of a
//! `RunState`: object keys are sorted before serialization, so two
//! semantically-equal states (field order aside) always hash the same.

use serde::Serialize;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Serialize `value` into a canonical JSON string: object keys sorted
/// recursively, arrays left in place (order is semantically meaningful for
/// this data model — e.g. `interruption_stack`).
pub fn canonical_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let v = serde_json::to_value(value)?;
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Compute the etag for `value`: the hex-encoded hash of its canonical
/// serialization. Not cryptographically secure — optimistic-concurrency
/// tokens don't need to resist adversarial collision, only detect the
/// common case of a stale read.
pub fn etag_of<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let canon = canonical_json(value)?;
    let mut hasher = DefaultHasher::new();
    canon.hash(&mut hasher);
    Ok(format!("{:016x}", hasher.finish()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn etag_is_stable_under_key_reordering() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(etag_of(&a).unwrap(), etag_of(&b).unwrap());
    }

    #[test]
    fn etag_changes_with_content() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_ne!(etag_of(&a).unwrap(), etag_of(&b).unwrap());
    }
}
