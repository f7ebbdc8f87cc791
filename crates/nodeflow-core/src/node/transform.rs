//! Transform nodes: reshape data with a template tree or an expression.

use nodeflow_types::result::NodeResult;
use nodeflow_types::workflow::TransformConfig;
use serde_json::Value;

use super::NodeError;
use crate::binding::{BoundContext, ConditionEvaluator, render_value};

pub(super) fn run_transform(config: &TransformConfig, bound: &BoundContext) -> Result<NodeResult, NodeError> {
    let output = match (&config.output, &config.expression) {
        (Some(template), _) => render_value(template, bound),
        (None, Some(expression)) => {
            ConditionEvaluator::new().evaluate_value(expression, &bound.to_value())?
        }
        (None, None) => Value::Null,
    };
    Ok(NodeResult::success(output))
}

#[cfg(test)]
mod tests {
    use super::super::testing::bound;
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_output_tree() {
        let config = TransformConfig {
            output: Some(json!({"title": "{{ fetch.title }}", "count": "{{ fetch.n }}"})),
            expression: None,
        };
        let result = run_transform(&config, &bound(json!({"fetch": {"title": "T", "n": 4}}))).unwrap();
        assert_eq!(result.output, json!({"title": "T", "count": 4}));
    }

    #[test]
    fn evaluates_expression() {
        let config = TransformConfig {
            output: None,
            expression: Some("score.value * 2".into()),
        };
        let result = run_transform(&config, &bound(json!({"score": {"value": 21}}))).unwrap();
        assert_eq!(result.output.as_f64(), Some(42.0));
    }

    #[test]
    fn bad_expression_is_an_error() {
        let config = TransformConfig {
            output: None,
            expression: Some("(((".into()),
        };
        assert!(matches!(
            run_transform(&config, &bound(json!({}))),
            Err(NodeError::Expression(_))
        ));
    }
}
