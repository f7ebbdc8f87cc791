//! Engine configuration for nodeflow.
//!
//! `EngineConfig` represents the `nodeflow.toml` file that controls time
//! budgets, concurrency, caching and the live capabilities. Every field has
//! a default, so an empty file is a valid configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Whole-run budget used when a workflow declares no `timeout_secs`.
    #[serde(default = "default_workflow_timeout_secs")]
    pub workflow_timeout_secs: u64,

    /// Per-node budget used when a node declares no `timeout_secs`.
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,

    /// Maximum nodes running at once across a run (0 = unbounded).
    #[serde(default)]
    pub max_concurrency: usize,

    /// Model used by llm nodes that name none.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Temperature used by llm nodes that set none.
    #[serde(default = "default_temperature")]
    pub default_temperature: f64,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub code: CodeSettings,

    #[serde(default)]
    pub http: HttpSettings,

    /// Prefixes of process environment variables injected into runs.
    /// Empty means every variable is injected.
    #[serde(default)]
    pub env_allowlist: Vec<String>,

    /// Finished runs kept queryable by id; the oldest are evicted first
    /// (0 = keep until removed).
    #[serde(default = "default_retained_runs")]
    pub retained_runs: usize,
}

fn default_workflow_timeout_secs() -> u64 {
    1800
}

fn default_node_timeout_secs() -> u64 {
    300
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_retained_runs() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workflow_timeout_secs: default_workflow_timeout_secs(),
            node_timeout_secs: default_node_timeout_secs(),
            max_concurrency: 0,
            default_model: default_model(),
            default_temperature: default_temperature(),
            cache: CacheSettings::default(),
            code: CodeSettings::default(),
            http: HttpSettings::default(),
            env_allowlist: Vec::new(),
            retained_runs: default_retained_runs(),
        }
    }
}

/// Node result cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Master switch; when false no node is cached.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Optional namespace prepended to every cache key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Top-level bound-context keys excluded from the context hash.
    #[serde(default = "default_exclude_keys")]
    pub exclude_keys: Vec<String>,

    /// Per-node-type overrides keyed by type name (`llm`, `http`, ...).
    #[serde(default)]
    pub policies: BTreeMap<String, CachePolicyOverride>,
}

fn default_true() -> bool {
    true
}

/// Keys that change on every run and would defeat cross-run cache hits.
pub fn default_exclude_keys() -> Vec<String> {
    ["execution_id", "run_id", "timestamp", "started_at", "env"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: None,
            exclude_keys: default_exclude_keys(),
            policies: BTreeMap::new(),
        }
    }
}

/// Override of the built-in cache policy for one node type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachePolicyOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

/// Settings for the subprocess code runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeSettings {
    /// Interpreter used for `language: python`.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_code_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_code_timeout_secs() -> u64 {
    60
}

impl Default for CodeSettings {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            timeout_secs: default_code_timeout_secs(),
        }
    }
}

/// Settings for the HTTP client used by http nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("nodeflow/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}
