//! Deterministic cache keys.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Separator between cache key components.
pub const KEY_SEPARATOR: char = ':';

/// Copy a value with every object's keys sorted, recursively.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let sorted: Map<String, Value> = keys
                .into_iter()
                .map(|k| (k.clone(), canonicalize(&map[k])))
                .collect();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// SHA-256 (lowercase hex) of the value's canonical JSON form.
///
/// Equal mappings hash equally regardless of key insertion order.
pub fn stable_hash(value: &Value) -> String {
    let canonical = serde_json::to_string(&canonicalize(value)).unwrap_or_default();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

/// Drop excluded top-level keys from an object. Non-objects pass through.
pub fn filter_context(value: &Value, exclude_keys: &[String]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !exclude_keys.iter().any(|e| e == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// `[prefix:]node_type:node_name:config_hash:context_hash`.
pub fn build_cache_key(
    prefix: Option<&str>,
    node_type: &str,
    node_name: &str,
    config: &Value,
    context: &Value,
    exclude_keys: &[String],
) -> String {
    let config_hash = stable_hash(config);
    let context_hash = stable_hash(&filter_context(context, exclude_keys));
    let parts = [node_type, node_name, config_hash.as_str(), context_hash.as_str()];
    let body = parts.join(&KEY_SEPARATOR.to_string());
    match prefix.filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}{KEY_SEPARATOR}{body}"),
        None => body,
    }
}
