//! Per-run execution context.
//!
//! `ExecutionContext` is owned by the engine loop. Outputs and errors are
//! append-only: a node records exactly one of them, once. Size limits keep a
//! misbehaving node from growing the context without bound.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::binding::{Scope, resolve_reference};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum serialized size of a single node output (1 MiB).
pub const MAX_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum serialized size of all recorded outputs (10 MiB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// ContextError
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("node '{0}' already has a recorded result")]
    AlreadyRecorded(String),

    #[error("total context size ({size} bytes) exceeds maximum ({max} bytes)")]
    ContextFull { size: usize, max: usize },
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub workflow_name: String,
    inputs: Map<String, Value>,
    env: Map<String, Value>,
    outputs: HashMap<String, Value>,
    errors: BTreeMap<String, String>,
    parallel_results: HashMap<String, Vec<Value>>,
    total_size: usize,
}

impl ExecutionContext {
    pub fn new(
        run_id: Uuid,
        workflow_name: impl Into<String>,
        inputs: Map<String, Value>,
        env: Map<String, Value>,
    ) -> Self {
        Self {
            run_id,
            workflow_name: workflow_name.into(),
            inputs,
            env,
            outputs: HashMap::new(),
            errors: BTreeMap::new(),
            parallel_results: HashMap::new(),
            total_size: 0,
        }
    }

    /// Record a node's output.
    ///
    /// Outputs over `MAX_OUTPUT_SIZE` are replaced by a truncation marker.
    /// Fails when the node already has an output or error, or when the
    /// output would push the context over `MAX_CONTEXT_SIZE`.
    pub fn record_output(&mut self, node: &str, output: Value) -> Result<(), ContextError> {
        self.ensure_unrecorded(node)?;

        let size = serialized_size(&output);
        let (output, size) = if size > MAX_OUTPUT_SIZE {
            tracing::warn!(
                run_id = %self.run_id,
                node,
                size,
                max = MAX_OUTPUT_SIZE,
                "node output exceeds size limit, truncating"
            );
            let marker = json!({
                "_truncated": true,
                "_original_size": size,
                "_message": format!("output exceeded {MAX_OUTPUT_SIZE} byte limit and was truncated"),
            });
            let marker_size = serialized_size(&marker);
            (marker, marker_size)
        } else {
            (output, size)
        };

        let total = self.total_size + size;
        if total > MAX_CONTEXT_SIZE {
            return Err(ContextError::ContextFull {
                size: total,
                max: MAX_CONTEXT_SIZE,
            });
        }
        self.total_size = total;
        self.outputs.insert(node.to_string(), output);
        Ok(())
    }

    /// Record a node's failure message.
    pub fn record_error(&mut self, node: &str, error: impl Into<String>) -> Result<(), ContextError> {
        self.ensure_unrecorded(node)?;
        self.errors.insert(node.to_string(), error.into());
        Ok(())
    }

    fn ensure_unrecorded(&self, node: &str) -> Result<(), ContextError> {
        if self.outputs.contains_key(node) || self.errors.contains_key(node) {
            return Err(ContextError::AlreadyRecorded(node.to_string()));
        }
        Ok(())
    }

    pub fn output(&self, node: &str) -> Option<&Value> {
        self.outputs.get(node)
    }

    pub fn outputs(&self) -> &HashMap<String, Value> {
        &self.outputs
    }

    pub fn error(&self, node: &str) -> Option<&str> {
        self.errors.get(node).map(String::as_str)
    }

    pub fn errors(&self) -> &BTreeMap<String, String> {
        &self.errors
    }

    pub fn inputs(&self) -> &Map<String, Value> {
        &self.inputs
    }

    pub fn env(&self) -> &Map<String, Value> {
        &self.env
    }

    /// Per-item results of an expansion, waiting for the paired aggregate.
    pub fn set_parallel_results(&mut self, expander: &str, results: Vec<Value>) {
        self.parallel_results.insert(expander.to_string(), results);
    }

    /// Hand the per-item results of `expander` to its aggregate, clearing them.
    pub fn take_parallel_results(&mut self, expander: &str) -> Option<Vec<Value>> {
        self.parallel_results.remove(expander)
    }

    /// Read-only view for reference resolution.
    pub fn scope(&self) -> Scope<'_> {
        Scope::new(&self.outputs, &self.inputs, &self.env)
    }

    /// Resolve the workflow's declared outputs. Absent references are omitted.
    pub fn resolve_outputs(&self, outputs: &BTreeMap<String, String>) -> Map<String, Value> {
        let scope = self.scope();
        outputs
            .iter()
            .filter_map(|(name, reference)| {
                resolve_reference(reference, &scope).map(|value| (name.clone(), value))
            })
            .collect()
    }
}

fn serialized_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|bytes| bytes.len()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
