//! Per-node-type cache policy.

use std::collections::HashMap;
use std::time::Duration;

use nodeflow_types::config::CacheSettings;
use nodeflow_types::workflow::{NodeDefinition, NodeType};
use serde_json::Value;

/// Whether a node's results are cached, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub enabled: bool,
    pub ttl: Option<Duration>,
}

impl CachePolicy {
    pub const DISABLED: CachePolicy = CachePolicy {
        enabled: false,
        ttl: None,
    };

    fn enabled_for(secs: u64) -> Self {
        Self {
            enabled: true,
            ttl: Some(Duration::from_secs(secs)),
        }
    }
}

/// Policy per node type.
///
/// External calls (`llm`, `http`, `code`) are cached by default; pure
/// data-flow nodes are not, since their output is a function of upstream
/// state. Branching and expanding nodes are never cached because their
/// outcome drives scheduling, not just data.
#[derive(Debug, Clone)]
pub struct CachePolicyTable {
    enabled: bool,
    policies: HashMap<NodeType, CachePolicy>,
}

impl Default for CachePolicyTable {
    fn default() -> Self {
        let policies = NodeType::ALL
            .into_iter()
            .map(|t| {
                let policy = match t {
                    NodeType::Llm => CachePolicy::enabled_for(3600),
                    NodeType::Http => CachePolicy::enabled_for(300),
                    NodeType::Code => CachePolicy::enabled_for(600),
                    _ => CachePolicy::DISABLED,
                };
                (t, policy)
            })
            .collect();
        Self {
            enabled: true,
            policies,
        }
    }
}

impl CachePolicyTable {
    /// Built-in defaults with the configured per-type overrides applied.
    pub fn from_settings(settings: &CacheSettings) -> Self {
        let mut table = Self {
            enabled: settings.enabled,
            ..Self::default()
        };
        for (name, override_) in &settings.policies {
            let Ok(node_type) = serde_json::from_value::<NodeType>(Value::String(name.clone())) else {
                tracing::warn!(node_type = %name, "ignoring cache policy for unknown node type");
                continue;
            };
            let policy = table.policies.entry(node_type).or_insert(CachePolicy::DISABLED);
            if let Some(enabled) = override_.enabled {
                policy.enabled = enabled;
            }
            if let Some(ttl) = override_.ttl_secs {
                policy.ttl = Some(Duration::from_secs(ttl));
            }
        }
        table
    }

    /// Policy for a node type, ignoring node-level overrides.
    pub fn for_type(&self, node_type: NodeType) -> CachePolicy {
        self.policies
            .get(&node_type)
            .copied()
            .unwrap_or(CachePolicy::DISABLED)
    }

    /// Effective policy for one node: type policy, then the node's own
    /// `cache` and `cache_ttl_secs`.
    pub fn for_node(&self, node: &NodeDefinition) -> CachePolicy {
        if !self.enabled || node.node_type.is_branching() || node.node_type.is_expander() {
            return CachePolicy::DISABLED;
        }
        let mut policy = self.for_type(node.node_type);
        if let Some(enabled) = node.cache {
            policy.enabled = enabled;
        }
        if let Some(ttl) = node.cache_ttl_secs {
            policy.ttl = Some(Duration::from_secs(ttl));
        }
        policy
    }
}
