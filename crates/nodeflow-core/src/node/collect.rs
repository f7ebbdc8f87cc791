//! Aggregate and join nodes: fan-in over per-item results or upstream
//! branches.

use nodeflow_types::result::NodeResult;
use nodeflow_types::workflow::{AggregateConfig, JoinConfig, NodeDefinition};
use serde_json::{Map, Value};

use super::{NodeError, NodeInput};
use crate::binding::{BoundContext, value_to_string};

pub(super) fn run_aggregate(
    config: &AggregateConfig,
    node: &NodeDefinition,
    input: &NodeInput,
) -> Result<NodeResult, NodeError> {
    let results = match &input.parallel_results {
        Some(results) => results.clone(),
        None => {
            tracing::warn!(
                node = %node.name,
                "no parallel results for aggregate, collecting dependency outputs instead"
            );
            collect_dependency_outputs(node, &input.bound)
        }
    };

    let results: Vec<Value> = match &config.field {
        Some(field) => results
            .iter()
            .map(|r| r.get(field.as_str()).cloned().unwrap_or(Value::Null))
            .collect(),
        None => results,
    };

    let count = results.len();
    let output = aggregate(&config.mode, results)?;
    Ok(NodeResult::success(output).with_metadata("count", count))
}

/// Fallback input: each dependency's output in `depends_on` order, with
/// list outputs flattened.
fn collect_dependency_outputs(node: &NodeDefinition, bound: &BoundContext) -> Vec<Value> {
    let mut collected = Vec::new();
    for dep in &node.depends_on {
        match bound.get(dep) {
            Some(Value::Array(items)) => collected.extend(items.iter().cloned()),
            Some(other) => collected.push(other.clone()),
            None => {}
        }
    }
    collected
}

/// Combine results per `mode`: `array`, `object` or `merge`.
pub fn aggregate(mode: &str, results: Vec<Value>) -> Result<Value, NodeError> {
    match mode {
        "array" => Ok(Value::Array(results)),
        "object" => Ok(Value::Object(
            results
                .into_iter()
                .enumerate()
                .map(|(i, r)| (i.to_string(), r))
                .collect(),
        )),
        "merge" => {
            let mut merged = Map::new();
            for (i, result) in results.into_iter().enumerate() {
                match result {
                    Value::Object(map) => {
                        for (k, v) in map {
                            merged.insert(format!("{i}_{k}"), v);
                        }
                    }
                    other => {
                        merged.insert(format!("result_{i}"), other);
                    }
                }
            }
            Ok(Value::Object(merged))
        }
        other => Err(NodeError::UnknownMode {
            kind: "aggregate",
            mode: other.to_string(),
        }),
    }
}

pub(super) fn run_join(
    config: &JoinConfig,
    node: &NodeDefinition,
    bound: &BoundContext,
) -> Result<NodeResult, NodeError> {
    let sources: &[String] = if config.sources.is_empty() {
        &node.depends_on
    } else {
        &config.sources
    };
    let present: Vec<(&str, Value)> = sources
        .iter()
        .filter_map(|s| bound.lookup(s).map(|v| (s.as_str(), v.clone())))
        .collect();
    let count = present.len();

    let output = match config.mode.as_str() {
        "object" => Value::Object(
            present
                .into_iter()
                .map(|(source, v)| (source.to_string(), v))
                .collect(),
        ),
        "array" => Value::Array(present.into_iter().map(|(_, v)| v).collect()),
        "merge" => {
            let mut merged = Map::new();
            for (source, value) in present {
                match value {
                    Value::Object(map) => merged.extend(map),
                    _ => tracing::debug!(source, "join merge ignores non-object source"),
                }
            }
            Value::Object(merged)
        }
        "concat" => Value::String(
            present
                .iter()
                .map(|(_, v)| value_to_string(v))
                .collect::<Vec<_>>()
                .join(&config.separator),
        ),
        other => {
            return Err(NodeError::UnknownMode {
                kind: "join",
                mode: other.to_string(),
            });
        }
    };
    Ok(NodeResult::success(output).with_metadata("count", count))
}
