//! Node executors, one per node kind.
//!
//! `NodeRunner` dispatches on `NodeConfig` with an exhaustive match, so a
//! new node kind does not compile until it has a handler. Handlers return
//! `Result<_, NodeError>` internally; `execute` turns every error into a
//! failed `NodeResult`, so callers never see an `Err`.

mod branch;
mod collect;
mod external;
mod fanout;
mod transform;

use std::sync::Arc;

use nodeflow_types::config::EngineConfig;
use nodeflow_types::result::NodeResult;
use nodeflow_types::service::ServiceError;
use nodeflow_types::workflow::{NodeConfig, NodeDefinition};
use serde_json::Value;

use crate::binding::{BoundContext, ExpressionError};
use crate::service::NodeServices;

// ---------------------------------------------------------------------------
// Inputs and outcomes
// ---------------------------------------------------------------------------

/// Everything one executor invocation needs. Owned, so the task never
/// touches run state.
#[derive(Debug, Clone)]
pub struct NodeInput {
    pub node: Arc<NodeDefinition>,
    pub bound: BoundContext,
    /// Per-item results handed to an aggregate node by its paired expander.
    pub parallel_results: Option<Vec<Value>>,
    /// Subgraph a split node expands into (its non-aggregate dependents).
    pub split_targets: Vec<String>,
}

impl NodeInput {
    pub fn new(node: Arc<NodeDefinition>, bound: BoundContext) -> Self {
        Self {
            node,
            bound,
            parallel_results: None,
            split_targets: Vec::new(),
        }
    }
}

/// Dynamic fan-out requested by a split or foreach node.
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    pub items: Vec<Value>,
    pub item_name: String,
    /// Nodes executed once per item.
    pub subgraph: Vec<String>,
    pub parallel: bool,
    pub max_concurrency: Option<usize>,
    /// Whether per-item results are handed to the paired aggregate.
    pub collect_output: bool,
}

/// What an executor produced, as a first-class scheduler transition.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// A plain result (success or failure).
    Finished(NodeResult),
    /// A branching node selected `target`; its other targets are pruned.
    Routed { result: NodeResult, target: String },
    /// An expander resolved its items; the engine runs the subgraph per item.
    Expand {
        result: NodeResult,
        expansion: Expansion,
    },
}

impl NodeOutcome {
    pub fn result(&self) -> &NodeResult {
        match self {
            NodeOutcome::Finished(result)
            | NodeOutcome::Routed { result, .. }
            | NodeOutcome::Expand { result, .. } => result,
        }
    }

    pub fn into_result(self) -> NodeResult {
        match self {
            NodeOutcome::Finished(result)
            | NodeOutcome::Routed { result, .. }
            | NodeOutcome::Expand { result, .. } => result,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result().success
    }

    pub(crate) fn map_result(self, f: impl FnOnce(NodeResult) -> NodeResult) -> Self {
        match self {
            NodeOutcome::Finished(result) => NodeOutcome::Finished(f(result)),
            NodeOutcome::Routed { result, target } => NodeOutcome::Routed {
                result: f(result),
                target,
            },
            NodeOutcome::Expand { result, expansion } => NodeOutcome::Expand {
                result: f(result),
                expansion,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// NodeError
// ---------------------------------------------------------------------------

/// Errors raised inside an executor. Always surfaced as a failed result.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("expected {expected} for '{reference}', got {found}")]
    TypeMismatch {
        expected: &'static str,
        reference: String,
        found: &'static str,
    },

    #[error("reference '{0}' did not resolve")]
    Unresolved(String),

    #[error("no condition matched")]
    NoConditionMatched,

    #[error("unknown {kind} mode '{mode}'")]
    UnknownMode { kind: &'static str, mode: String },

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("structured output is not valid JSON: {0}")]
    InvalidStructuredOutput(String),
}

/// JSON type name used in type-mismatch messages.
pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Resolve an `items` reference to a list.
pub(crate) fn resolve_items(bound: &BoundContext, reference: &str) -> Result<Vec<Value>, NodeError> {
    match bound.resolve(reference) {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(NodeError::TypeMismatch {
            expected: "array",
            reference: reference.to_string(),
            found: type_name(other),
        }),
        None => Err(NodeError::Unresolved(reference.to_string())),
    }
}

// ---------------------------------------------------------------------------
// NodeRunner
// ---------------------------------------------------------------------------

/// Defaults applied to llm nodes that leave model or temperature unset.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmDefaults {
    pub model: String,
    pub temperature: f64,
}

impl From<&EngineConfig> for LlmDefaults {
    fn from(config: &EngineConfig) -> Self {
        Self {
            model: config.default_model.clone(),
            temperature: config.default_temperature,
        }
    }
}

/// Executes individual nodes by dispatching to type-specific handlers.
#[derive(Clone)]
pub struct NodeRunner {
    services: Arc<dyn NodeServices>,
    llm_defaults: LlmDefaults,
}

impl NodeRunner {
    pub fn new(services: Arc<dyn NodeServices>, llm_defaults: LlmDefaults) -> Self {
        Self {
            services,
            llm_defaults,
        }
    }

    /// Run one node. Never fails outward: errors become failed results.
    pub async fn execute(&self, input: NodeInput) -> NodeOutcome {
        let node = Arc::clone(&input.node);
        let outcome = match &node.config {
            NodeConfig::Llm(config) => {
                external::run_llm(self.services.as_ref(), &self.llm_defaults, config, &input.bound)
                    .await
                    .map(NodeOutcome::Finished)
            }
            NodeConfig::Http(config) => external::run_http(self.services.as_ref(), config, &input.bound)
                .await
                .map(NodeOutcome::Finished),
            NodeConfig::Code(config) => external::run_code(self.services.as_ref(), config, &input.bound)
                .await
                .map(NodeOutcome::Finished),
            NodeConfig::Conditional(config) | NodeConfig::Route(config) => {
                branch::run_branch(config, &input.bound)
            }
            NodeConfig::Split(config) => fanout::run_split(config, &input),
            NodeConfig::Foreach(config) => fanout::run_foreach(config, &input.bound),
            NodeConfig::Filter(config) => {
                fanout::run_filter(config, &input.bound).map(NodeOutcome::Finished)
            }
            NodeConfig::Aggregate(config) => {
                collect::run_aggregate(config, &node, &input).map(NodeOutcome::Finished)
            }
            NodeConfig::Join(config) => {
                collect::run_join(config, &node, &input.bound).map(NodeOutcome::Finished)
            }
            NodeConfig::Transform(config) => {
                transform::run_transform(config, &input.bound).map(NodeOutcome::Finished)
            }
        };

        let outcome = outcome.unwrap_or_else(|e| {
            tracing::debug!(node = %node.name, node_type = %node.node_type, error = %e, "node failed");
            NodeOutcome::Finished(NodeResult::failure(e.to_string()))
        });
        outcome.map_result(|r| r.with_metadata("node_type", node.node_type.as_str()))
    }
}

impl std::fmt::Debug for NodeRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRunner")
            .field("llm_defaults", &self.llm_defaults)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------
