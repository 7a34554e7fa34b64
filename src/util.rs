//! Shared utility functions for the vizflow crate.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Rebuild a JSON value with every object's keys in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact JSON with sorted keys. Equal documents give equal strings.
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub const MAX_TASK_ID_LEN: usize = 128;

/// Task ids name trace files on disk, so they are limited to
/// `[A-Za-z0-9_-]+` and at most [`MAX_TASK_ID_LEN`] characters.
pub fn is_valid_task_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_TASK_ID_LEN
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": {"z": 1, "a": [{"y": 2, "x": 1}]}, "a": null});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":null,"b":{"a":[{"x":1,"y":2}],"z":1}}"#
        );
    }

    #[test]
    fn test_canonical_json_keeps_array_order() {
        assert_eq!(canonical_json(&json!([3, 1, 2])), "[3,1,2]");
    }

    #[test]
    fn test_task_id_charset() {
        assert!(is_valid_task_id("task_0f3a-B9"));
        assert!(!is_valid_task_id(""));
        assert!(!is_valid_task_id("../escaped"));
        assert!(!is_valid_task_id("a/b"));
        assert!(!is_valid_task_id("a.json"));
        assert!(!is_valid_task_id(&"x".repeat(MAX_TASK_ID_LEN + 1)));
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
