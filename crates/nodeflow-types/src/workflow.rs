//! Workflow domain types for nodeflow.
//!
//! Defines the canonical representation of a workflow document: the
//! workflow itself, its declared inputs and outputs, and the node graph with
//! one typed configuration per node kind. Node order is preserved exactly as
//! declared because the scheduler breaks ties by declaration order.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A parsed workflow document.
///
/// Created by parsing a YAML/JSON document and immutable afterwards. The
/// `nodes` list keeps declaration order; node names are unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Human-readable workflow name.
    pub name: String,
    /// Version string (e.g. "1.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared workflow inputs keyed by input name.
    #[serde(default)]
    pub inputs: BTreeMap<String, InputSpec>,
    /// Node graph in declaration order.
    #[serde(with = "node_map")]
    pub nodes: Vec<NodeDefinition>,
    /// Final outputs: output name -> `node` or `node.field` reference.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    /// Workflow-level time budget in seconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// What a node failure does to the rest of the run.
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl WorkflowDefinition {
    /// Look up a node by name.
    pub fn node(&self, name: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// How node failures affect the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Record the failure, fail dependents, keep sibling branches running.
    #[default]
    Continue,
    /// Abort the whole run on the first node failure without a fallback.
    Strict,
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Declaration of a single workflow input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    /// Expected value type.
    #[serde(rename = "type", default)]
    pub input_type: InputType,
    /// Whether the caller must supply the input (when no default exists).
    #[serde(default)]
    pub required: bool,
    /// Value used when the caller omits the input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Type tag of a workflow input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    #[default]
    Any,
}

impl InputType {
    /// Check whether a JSON value conforms to this input type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Number => value.is_number(),
            InputType::Integer => value.is_i64() || value.is_u64(),
            InputType::Boolean => value.is_boolean(),
            InputType::Array => value.is_array(),
            InputType::Object => value.is_object(),
            InputType::Any => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InputType::String => "string",
            InputType::Number => "number",
            InputType::Integer => "integer",
            InputType::Boolean => "boolean",
            InputType::Array => "array",
            InputType::Object => "object",
            InputType::Any => "any",
        }
    }
}

// ---------------------------------------------------------------------------
// Node type
// ---------------------------------------------------------------------------

/// The kind of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Llm,
    Http,
    /// Sandboxed code execution. `python` is accepted as an alias.
    #[serde(alias = "python")]
    Code,
    Conditional,
    Route,
    Split,
    Foreach,
    Aggregate,
    Filter,
    Transform,
    Join,
}

impl NodeType {
    /// All node types, in a stable order.
    pub const ALL: [NodeType; 11] = [
        NodeType::Llm,
        NodeType::Http,
        NodeType::Code,
        NodeType::Conditional,
        NodeType::Route,
        NodeType::Split,
        NodeType::Foreach,
        NodeType::Aggregate,
        NodeType::Filter,
        NodeType::Transform,
        NodeType::Join,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Llm => "llm",
            NodeType::Http => "http",
            NodeType::Code => "code",
            NodeType::Conditional => "conditional",
            NodeType::Route => "route",
            NodeType::Split => "split",
            NodeType::Foreach => "foreach",
            NodeType::Aggregate => "aggregate",
            NodeType::Filter => "filter",
            NodeType::Transform => "transform",
            NodeType::Join => "join",
        }
    }

    /// Split and foreach nodes fan out into a per-item subgraph.
    pub fn is_expander(&self) -> bool {
        matches!(self, NodeType::Split | NodeType::Foreach)
    }

    /// Conditional and route nodes select one target among several.
    pub fn is_branching(&self) -> bool {
        matches!(self, NodeType::Conditional | NodeType::Route)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Node definition
// ---------------------------------------------------------------------------

/// A single node in the workflow graph.
///
/// The name comes from the key of the `nodes` mapping. `config` has already
/// been validated against the shape its `node_type` requires.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDefinition {
    pub name: String,
    pub node_type: NodeType,
    /// Node names this node waits for (DAG edges).
    pub depends_on: Vec<String>,
    pub config: NodeConfig,
    /// Local variable name -> source reference.
    pub context: BTreeMap<String, String>,
    /// Per-node execution budget in seconds.
    pub timeout_secs: Option<u64>,
    pub retry: Option<RetryConfig>,
    /// Override of the per-type cache policy.
    pub cache: Option<bool>,
    /// Override of the per-type cache TTL.
    pub cache_ttl_secs: Option<u64>,
    /// Output recorded instead of a failure.
    pub fallback: Option<Value>,
}

impl NodeDefinition {
    /// Build a node from its map key and raw document form.
    ///
    /// Fails with a message naming the node when the config does not match
    /// the shape required by the node type.
    pub fn from_raw(name: String, raw: RawNodeDefinition) -> Result<Self, String> {
        let config_value = match raw.config {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other,
        };
        let config = NodeConfig::parse(raw.node_type, config_value).map_err(|e| {
            format!("node '{}' has invalid {} config: {}", name, raw.node_type, e)
        })?;
        Ok(Self {
            name,
            node_type: raw.node_type,
            depends_on: raw.depends_on,
            config,
            context: raw.context,
            timeout_secs: raw.timeout_secs,
            retry: raw.retry,
            cache: raw.cache,
            cache_ttl_secs: raw.cache_ttl_secs,
            fallback: raw.fallback,
        })
    }

    /// Convert back into the document form (used for serialization).
    pub fn to_raw(&self) -> RawNodeDefinition {
        RawNodeDefinition {
            node_type: self.node_type,
            depends_on: self.depends_on.clone(),
            config: self.config.to_value(),
            context: self.context.clone(),
            timeout_secs: self.timeout_secs,
            retry: self.retry.clone(),
            cache: self.cache,
            cache_ttl_secs: self.cache_ttl_secs,
            fallback: self.fallback.clone(),
        }
    }

    /// References held in the config that must resolve to a node, an input,
    /// or (inside fan-out) the current item.
    pub fn config_references(&self) -> Vec<&str> {
        match &self.config {
            NodeConfig::Split(c) => vec![c.items.as_str()],
            NodeConfig::Foreach(c) => vec![c.items.as_str()],
            NodeConfig::Filter(c) => vec![c.items.as_str()],
            NodeConfig::Join(c) => c.sources.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Every reference this node reads: context locals plus config references.
    pub fn references(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = self.context.values().map(String::as_str).collect();
        refs.extend(self.config_references());
        refs
    }
}

/// Document form of a node, before the config is validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawNodeDefinition {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Value>,
}

/// Split a reference into its head segment and the remaining dotted path.
///
/// `"fetch.body.items"` -> `("fetch", Some("body.items"))`.
pub fn split_reference(reference: &str) -> (&str, Option<&str>) {
    match reference.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (reference, None),
    }
}

// ---------------------------------------------------------------------------
// Retry Configuration
// ---------------------------------------------------------------------------

/// Retry configuration for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds (default 500).
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
    /// Multiplier applied to the delay after each retry (default 2.0).
    #[serde(default = "default_backoff")]
    pub backoff: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_backoff() -> f64 {
    2.0
}

// ---------------------------------------------------------------------------
// Node configs
// ---------------------------------------------------------------------------

/// Type-specific node configuration, one variant per node kind.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeConfig {
    Llm(LlmConfig),
    Http(HttpConfig),
    Code(CodeConfig),
    Conditional(RouteConfig),
    Route(RouteConfig),
    Split(SplitConfig),
    Foreach(ForeachConfig),
    Aggregate(AggregateConfig),
    Filter(FilterConfig),
    Transform(TransformConfig),
    Join(JoinConfig),
}

impl NodeConfig {
    /// Validate a raw config object against the shape of `node_type`.
    pub fn parse(node_type: NodeType, value: Value) -> Result<Self, serde_json::Error> {
        let config = match node_type {
            NodeType::Llm => NodeConfig::Llm(serde_json::from_value(value)?),
            NodeType::Http => NodeConfig::Http(serde_json::from_value(value)?),
            NodeType::Code => NodeConfig::Code(serde_json::from_value(value)?),
            NodeType::Conditional => NodeConfig::Conditional(serde_json::from_value(value)?),
            NodeType::Route => NodeConfig::Route(serde_json::from_value(value)?),
            NodeType::Split => NodeConfig::Split(serde_json::from_value(value)?),
            NodeType::Foreach => NodeConfig::Foreach(serde_json::from_value(value)?),
            NodeType::Aggregate => NodeConfig::Aggregate(serde_json::from_value(value)?),
            NodeType::Filter => NodeConfig::Filter(serde_json::from_value(value)?),
            NodeType::Transform => {
                let transform: TransformConfig = serde_json::from_value(value)?;
                if transform.output.is_some() == transform.expression.is_some() {
                    return Err(de::Error::custom(
                        "transform requires exactly one of `output` or `expression`",
                    ));
                }
                NodeConfig::Transform(transform)
            }
            NodeType::Join => NodeConfig::Join(serde_json::from_value(value)?),
        };
        Ok(config)
    }

    /// The node type this config belongs to.
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeConfig::Llm(_) => NodeType::Llm,
            NodeConfig::Http(_) => NodeType::Http,
            NodeConfig::Code(_) => NodeType::Code,
            NodeConfig::Conditional(_) => NodeType::Conditional,
            NodeConfig::Route(_) => NodeType::Route,
            NodeConfig::Split(_) => NodeType::Split,
            NodeConfig::Foreach(_) => NodeType::Foreach,
            NodeConfig::Aggregate(_) => NodeType::Aggregate,
            NodeConfig::Filter(_) => NodeType::Filter,
            NodeConfig::Transform(_) => NodeType::Transform,
            NodeConfig::Join(_) => NodeType::Join,
        }
    }

    /// Serialize the config back into a JSON object.
    pub fn to_value(&self) -> Value {
        let result = match self {
            NodeConfig::Llm(c) => serde_json::to_value(c),
            NodeConfig::Http(c) => serde_json::to_value(c),
            NodeConfig::Code(c) => serde_json::to_value(c),
            NodeConfig::Conditional(c) | NodeConfig::Route(c) => serde_json::to_value(c),
            NodeConfig::Split(c) => serde_json::to_value(c),
            NodeConfig::Foreach(c) => serde_json::to_value(c),
            NodeConfig::Aggregate(c) => serde_json::to_value(c),
            NodeConfig::Filter(c) => serde_json::to_value(c),
            NodeConfig::Transform(c) => serde_json::to_value(c),
            NodeConfig::Join(c) => serde_json::to_value(c),
        };
        result.unwrap_or(Value::Null)
    }
}

/// Call a language model with a rendered prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    /// Prompt template.
    pub prompt: String,
    /// Optional system prompt template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Model name (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// JSON schema for structured output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Make an HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// URL template.
    pub url: String,
    #[serde(default = "default_http_method")]
    pub method: String,
    /// Header name -> value template.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Query parameter name -> value template.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
    /// Request body; strings inside are templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Treat non-2xx responses as node failures (default true).
    #[serde(default = "default_true")]
    pub fail_on_status: bool,
}

fn default_http_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

/// Run source code in the sandboxed code runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodeConfig {
    pub code: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_language() -> String {
    "python".to_string()
}

/// Ordered condition -> target rules shared by conditional and route nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    /// Evaluated in order; the first truthy condition wins.
    #[serde(default)]
    pub conditions: Vec<ConditionRule>,
    /// Target selected when no condition matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl RouteConfig {
    /// Every target this node can select, rules first, without duplicates.
    pub fn targets(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.conditions
            .iter()
            .map(|r| r.target.as_str())
            .chain(self.default.as_deref())
            .filter(|t| seen.insert(*t))
            .collect()
    }
}

/// A single `condition -> target` rule. The literal condition `default`
/// always matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionRule {
    pub condition: String,
    pub target: String,
}

/// Fan out over a list; the direct dependents run once per item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SplitConfig {
    /// Reference to the array to split.
    pub items: String,
    /// Name the current item is bound under.
    #[serde(default = "default_item_name")]
    pub item_name: String,
    #[serde(default = "default_true")]
    pub parallel: bool,
    /// Maximum items in flight when parallel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

fn default_item_name() -> String {
    "item".to_string()
}

/// Fan out over a list; a declared subgraph runs once per item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForeachConfig {
    pub items: String,
    #[serde(default = "default_item_name")]
    pub item_name: String,
    #[serde(default = "default_true")]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Node names executed once per item.
    pub subgraph: Vec<String>,
    /// Whether per-item results are handed to the paired aggregate.
    #[serde(default = "default_true")]
    pub collect_output: bool,
}

/// Combine the per-item results of a fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateConfig {
    /// `array`, `object` or `merge`.
    #[serde(default = "default_aggregate_mode")]
    pub mode: String,
    /// Field extracted from each result before aggregation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Split/foreach node whose results are aggregated (nearest upstream
    /// expander when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

fn default_aggregate_mode() -> String {
    "array".to_string()
}

/// Keep the items of a list that satisfy a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    pub items: String,
    pub condition: String,
    #[serde(default = "default_item_name")]
    pub item_name: String,
}

/// Reshape data with a template tree or an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

/// Combine the outputs of several upstream branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinConfig {
    /// References to join (defaults to `depends_on`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    /// `object`, `array`, `merge` or `concat`.
    #[serde(default = "default_join_mode")]
    pub mode: String,
    #[serde(default = "default_separator")]
    pub separator: String,
}

fn default_join_mode() -> String {
    "object".to_string()
}

fn default_separator() -> String {
    "\n".to_string()
}

// ---------------------------------------------------------------------------
// Ordered node map (de)serialization
// ---------------------------------------------------------------------------

/// Serde adapter keeping `nodes` as an ordered list while the document
/// form is a mapping of node name -> node definition.
mod node_map {
    use super::*;

    pub fn serialize<S: Serializer>(
        nodes: &[NodeDefinition],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(nodes.len()))?;
        for node in nodes {
            map.serialize_entry(&node.name, &node.to_raw())?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<NodeDefinition>, D::Error> {
        deserializer.deserialize_map(NodeMapVisitor)
    }

    struct NodeMapVisitor;

    impl<'de> Visitor<'de> for NodeMapVisitor {
        type Value = Vec<NodeDefinition>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a mapping of node name to node definition")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut nodes = Vec::with_capacity(access.size_hint().unwrap_or(0));
            let mut seen = HashSet::new();
            while let Some((name, raw)) = access.next_entry::<String, RawNodeDefinition>()? {
                if !seen.insert(name.clone()) {
                    return Err(de::Error::custom(format!("duplicate node name '{name}'")));
                }
                nodes.push(NodeDefinition::from_raw(name, raw).map_err(de::Error::custom)?);
            }
            Ok(nodes)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
