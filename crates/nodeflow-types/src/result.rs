//! Result of a single node execution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of exactly one executor invocation.
///
/// A successful result carries an output and no error; a failed result
/// carries an error message and a `null` output. Metadata is free-form
/// diagnostics (node type tag, cache hit flag, counts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub output: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl NodeResult {
    pub fn success(output: Value) -> Self {
        Self {
            output,
            success: true,
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            output: Value::Null,
            success: false,
            error: Some(error.into()),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry, replacing any previous value for the key.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Error message for a failed result (empty string never returned).
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("unknown error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_has_no_error() {
        let r = NodeResult::success(json!({"a": 1})).with_metadata("node_type", "transform");
        assert!(r.success);
        assert!(r.error.is_none());
        assert_eq!(r.metadata["node_type"], json!("transform"));
    }

    #[test]
    fn failure_has_null_output() {
        let r = NodeResult::failure("boom");
        assert!(!r.success);
        assert_eq!(r.output, Value::Null);
        assert_eq!(r.error_message(), "boom");
    }

    #[test]
    fn metadata_omitted_when_empty() {
        let json = serde_json::to_value(NodeResult::success(json!(1))).unwrap();
        assert!(json.get("metadata").is_none());
        assert!(json.get("error").is_none());
    }
}
