//! `NodeCache`: the read-through/write-behind wrapper the engine uses
//! around cacheable executor calls.

use std::sync::Arc;

use nodeflow_types::config::CacheSettings;
use nodeflow_types::workflow::NodeDefinition;
use serde_json::Value;

use super::backend::BoxCacheBackend;
use super::key::build_cache_key;
use super::policy::{CachePolicy, CachePolicyTable};

/// Cache manager shared by every node task of an engine.
#[derive(Clone, Debug)]
pub struct NodeCache {
    backend: Arc<BoxCacheBackend>,
    policies: CachePolicyTable,
    prefix: Option<String>,
    exclude_keys: Vec<String>,
}

impl NodeCache {
    pub fn new(backend: BoxCacheBackend, settings: &CacheSettings) -> Self {
        Self {
            backend: Arc::new(backend),
            policies: CachePolicyTable::from_settings(settings),
            prefix: settings.prefix.clone(),
            exclude_keys: settings.exclude_keys.clone(),
        }
    }

    pub fn policy_for(&self, node: &NodeDefinition) -> CachePolicy {
        self.policies.for_node(node)
    }

    /// Key for one node invocation.
    pub fn key_for(&self, node: &NodeDefinition, context: &Value) -> String {
        build_cache_key(
            self.prefix.as_deref(),
            node.node_type.as_str(),
            &node.name,
            &node.config.to_value(),
            context,
            &self.exclude_keys,
        )
    }

    /// Look up a cached output. Backend errors count as a miss.
    pub async fn get_cached_result(&self, node: &NodeDefinition, context: &Value) -> Option<Value> {
        if !self.policy_for(node).enabled {
            return None;
        }
        let key = self.key_for(node, context);
        match self.backend.get(&key).await {
            Ok(hit) => {
                tracing::debug!(node = %node.name, hit = hit.is_some(), "cache lookup");
                hit
            }
            Err(e) => {
                tracing::debug!(node = %node.name, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Store a successful output. Backend errors are logged and dropped.
    pub async fn cache_result(&self, node: &NodeDefinition, context: &Value, output: &Value) {
        let policy = self.policy_for(node);
        if !policy.enabled {
            return;
        }
        let key = self.key_for(node, context);
        if let Err(e) = self.backend.set(&key, output.clone(), policy.ttl).await {
            tracing::warn!(node = %node.name, error = %e, "cache write failed");
        }
    }

    /// Drop every cached entry.
    pub async fn clear(&self) {
        if let Err(e) = self.backend.clear().await {
            tracing::warn!(error = %e, "cache clear failed");
        }
    }
}
