//! Dotted-path lookup and value coercions.

use serde_json::Value;

/// Walk `path` (segments separated by `.`) through nested objects.
///
/// Only objects are traversable: a missing key, an empty segment, or an
/// array or scalar anywhere along the way yields `None`. List indexing such
/// as `a.0` is unsupported and also yields `None`. An empty path returns
/// `value` itself.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| {
        if segment.is_empty() {
            return None;
        }
        match current {
            Value::Object(map) => map.get(segment),
            _ => None,
        }
    })
}

/// Render a value for string interpolation.
///
/// Strings are inserted as-is; everything else is compact JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Coerce a value to a boolean.
///
/// Strings `true`/`1`/`yes` are true and `false`/`0`/`no`/empty are false
/// (trimmed, case-insensitive); any other string is true. `null` is false,
/// numbers are true when non-zero, arrays and objects are true.
pub fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => coerce_str(s),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn coerce_str(s: &str) -> bool {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => true,
        "false" | "0" | "no" | "" => false,
        _ => true,
    }
}
