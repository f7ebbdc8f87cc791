//! Split, foreach and filter nodes.

use nodeflow_types::result::NodeResult;
use nodeflow_types::workflow::{FilterConfig, ForeachConfig, SplitConfig};
use serde_json::{Value, json};

use super::{Expansion, NodeError, NodeInput, NodeOutcome, resolve_items};
use crate::binding::{BoundContext, ConditionEvaluator, condition_holds};

fn descriptor(items: &[Value], item_name: &str) -> NodeResult {
    NodeResult::success(json!({
        "split_items": items,
        "item_name": item_name,
        "total_items": items.len(),
    }))
    .with_metadata("total_items", items.len())
}

/// Resolve the items and ask the engine to run the split's direct
/// dependents once per item.
pub(super) fn run_split(config: &SplitConfig, input: &NodeInput) -> Result<NodeOutcome, NodeError> {
    let items = resolve_items(&input.bound, &config.items)?;
    tracing::debug!(items = items.len(), "split resolved items");
    Ok(NodeOutcome::Expand {
        result: descriptor(&items, &config.item_name),
        expansion: Expansion {
            items,
            item_name: config.item_name.clone(),
            subgraph: input.split_targets.clone(),
            parallel: config.parallel,
            max_concurrency: config.max_concurrency,
            collect_output: true,
        },
    })
}

/// Resolve the items and ask the engine to run the declared subgraph once
/// per item.
pub(super) fn run_foreach(config: &ForeachConfig, bound: &BoundContext) -> Result<NodeOutcome, NodeError> {
    let items = resolve_items(bound, &config.items)?;
    tracing::debug!(items = items.len(), subgraph = ?config.subgraph, "foreach resolved items");
    Ok(NodeOutcome::Expand {
        result: descriptor(&items, &config.item_name),
        expansion: Expansion {
            items,
            item_name: config.item_name.clone(),
            subgraph: config.subgraph.clone(),
            parallel: config.parallel,
            max_concurrency: config.max_concurrency,
            collect_output: config.collect_output,
        },
    })
}

/// Keep the items whose condition holds with the item bound under
/// `item_name`.
pub(super) fn run_filter(config: &FilterConfig, bound: &BoundContext) -> Result<NodeResult, NodeError> {
    let items = resolve_items(bound, &config.items)?;
    let evaluator = ConditionEvaluator::new();
    let total = items.len();
    let kept: Vec<Value> = items
        .into_iter()
        .filter(|item| {
            let scoped = bound.with_binding(&config.item_name, item.clone());
            condition_holds(&evaluator, &config.condition, &scoped)
        })
        .collect();

    Ok(NodeResult::success(Value::Array(kept.clone()))
        .with_metadata("count", kept.len())
        .with_metadata("total_items", total))
}
