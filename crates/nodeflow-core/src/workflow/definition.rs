//! Workflow definition parsing and structural validation.
//!
//! Converts YAML or JSON documents into the canonical `WorkflowDefinition`
//! and runs the DAG validator, so every definition that leaves this module
//! is safe to schedule.

use std::path::Path;

use nodeflow_types::workflow::WorkflowDefinition;
use thiserror::Error;

use super::dag;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Definition errors. Detected before a run starts; the run never begins.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure, including node config shape errors.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Dependency graph contains a cycle.
    #[error("cycle detected involving node '{node}'")]
    CycleDetected { node: String },

    /// A `depends_on` entry names no declared node.
    #[error("node '{node}' depends on unknown node '{reference}'")]
    UnknownDependency { node: String, reference: String },

    /// A reference in a node's context/config or in the outputs resolves to
    /// nothing.
    #[error("{location} references unknown '{reference}'")]
    DanglingReference { location: String, reference: String },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML or JSON document into a validated `WorkflowDefinition`.
pub fn parse_workflow(source: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(source).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to YAML.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Load and validate a workflow file (`.yaml`, `.yml` or `.json`).
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow(&content)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Structural checks, then the full DAG validation.
///
/// Checks:
/// - Name is non-empty
/// - At least one node exists
/// - Timeouts are > 0 when set
/// - Retry `max_attempts` is >= 1
/// - Everything [`dag::validate`] checks
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if def.nodes.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one node".to_string(),
        ));
    }
    if def.timeout_secs == Some(0) {
        return Err(WorkflowError::ValidationError(
            "timeout_secs must be > 0".to_string(),
        ));
    }
    for node in &def.nodes {
        if node.timeout_secs == Some(0) {
            return Err(WorkflowError::ValidationError(format!(
                "node '{}' timeout_secs must be > 0",
                node.name
            )));
        }
        if let Some(retry) = &node.retry {
            if retry.max_attempts == 0 {
                return Err(WorkflowError::ValidationError(format!(
                    "node '{}' retry.max_attempts must be >= 1",
                    node.name
                )));
            }
        }
    }
    dag::validate(def)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
