//! Progress events broadcast during a workflow run.
//!
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::RunStatus;

/// Events emitted by the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A run has been admitted and is about to schedule its first nodes.
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
        node_count: usize,
    },

    /// A node task has been launched.
    NodeStarted {
        run_id: Uuid,
        node: String,
        node_type: String,
        /// Item index when running inside a fan-out.
        item_index: Option<usize>,
    },

    /// A node completed successfully.
    NodeCompleted {
        run_id: Uuid,
        node: String,
        duration_ms: u64,
        cache_hit: bool,
    },

    /// A node attempt failed.
    NodeFailed {
        run_id: Uuid,
        node: String,
        error: String,
        will_retry: bool,
    },

    /// A node was pruned or skipped.
    NodeSkipped {
        run_id: Uuid,
        node: String,
        reason: String,
    },

    /// A run reached a terminal state.
    RunFinished {
        run_id: Uuid,
        workflow_name: String,
        status: RunStatus,
        duration_ms: u64,
        error: Option<String>,
    },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::NodeStarted { run_id, .. }
            | WorkflowEvent::NodeCompleted { run_id, .. }
            | WorkflowEvent::NodeFailed { run_id, .. }
            | WorkflowEvent::NodeSkipped { run_id, .. }
            | WorkflowEvent::RunFinished { run_id, .. } => *run_id,
        }
    }

    /// Node name for node-scoped events.
    pub fn node(&self) -> Option<&str> {
        match self {
            WorkflowEvent::NodeStarted { node, .. }
            | WorkflowEvent::NodeCompleted { node, .. }
            | WorkflowEvent::NodeFailed { node, .. }
            | WorkflowEvent::NodeSkipped { node, .. } => Some(node),
            WorkflowEvent::RunStarted { .. } | WorkflowEvent::RunFinished { .. } => None,
        }
    }
}
