//! Conditional and route nodes.

use nodeflow_types::result::NodeResult;
use nodeflow_types::workflow::RouteConfig;
use serde_json::json;

use super::{NodeError, NodeOutcome};
use crate::binding::expression::DEFAULT_CONDITION;
use crate::binding::{BoundContext, ConditionEvaluator, condition_holds};

/// Select a target: first rule whose condition holds, then the `default`
/// target, otherwise a failure.
pub(super) fn run_branch(config: &RouteConfig, bound: &BoundContext) -> Result<NodeOutcome, NodeError> {
    let evaluator = ConditionEvaluator::new();
    let selected = config
        .conditions
        .iter()
        .find(|rule| condition_holds(&evaluator, &rule.condition, bound))
        .map(|rule| (rule.condition.trim().to_string(), rule.target.clone()))
        .or_else(|| {
            config
                .default
                .as_ref()
                .map(|target| (DEFAULT_CONDITION.to_string(), target.clone()))
        });

    let Some((condition, target)) = selected else {
        return Err(NodeError::NoConditionMatched);
    };

    tracing::debug!(condition = %condition, target = %target, "branch selected");
    let result = NodeResult::success(json!({ "target": target, "condition": condition }))
        .with_metadata("condition_met", condition.as_str())
        .with_metadata("selected_target", target.as_str());
    Ok(NodeOutcome::Routed { result, target })
}
