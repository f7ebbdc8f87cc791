//! JEXL expression evaluation for conditions, filters and transforms.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered standard transforms.
//! Data is always passed as the evaluation context and never interpolated
//! into the expression string, except for explicit `{{ }}` conditions which
//! are rendered and then coerced.

use serde_json::{Value, json};

use super::lookup::coerce_bool;
use super::scope::BoundContext;
use super::template::render_str;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with standard transforms registered.
///
/// Not shared across tasks; build one where it is needed.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!coerce_bool(&val)))
            })
            .with_transform("bool", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(coerce_bool(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let needle = args.get(1).cloned().unwrap_or(Value::Null);
                let found = match args.first() {
                    Some(Value::String(s)) => needle.as_str().is_some_and(|n| s.contains(n)),
                    Some(Value::Array(items)) => items.contains(&needle),
                    Some(Value::Object(map)) => needle.as_str().is_some_and(|k| map.contains_key(k)),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("keys", |args: &[Value]| {
                let keys: Vec<String> = match args.first() {
                    Some(Value::Object(o)) => o.keys().cloned().collect(),
                    _ => Vec::new(),
                };
                Ok(json!(keys))
            });

        Self { evaluator }
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    /// Evaluate an expression and coerce the result with [`coerce_bool`].
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context).map(|v| coerce_bool(&v))
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Literal condition that always matches.
pub const DEFAULT_CONDITION: &str = "default";

/// Decide whether a condition holds against a bound context.
///
/// `default` always holds. A condition containing `{{` is rendered as a
/// template and the resulting string coerced. Anything else is a JEXL
/// expression. Evaluation is fail-soft: an expression that errors (for
/// example a missing field compared with a number) does not hold.
pub fn condition_holds(evaluator: &ConditionEvaluator, condition: &str, ctx: &BoundContext) -> bool {
    let condition = condition.trim();
    if condition == DEFAULT_CONDITION {
        return true;
    }
    if condition.contains("{{") {
        return coerce_bool(&Value::String(render_str(condition, ctx)));
    }
    match evaluator.evaluate_bool(condition, &ctx.to_value()) {
        Ok(holds) => holds,
        Err(e) => {
            tracing::debug!(condition, error = %e, "condition evaluation failed, treating as false");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(v: Value) -> BoundContext {
        match v {
            Value::Object(m) => BoundContext::from_map(m),
            _ => BoundContext::default(),
        }
    }

    #[test]
    fn test_simple_comparison() {
        let eval = ConditionEvaluator::new();
        let ctx = json!({"data": {"score": 0.8}});
        assert!(eval.evaluate_bool("data.score > 0.5", &ctx).unwrap());
        assert!(!eval.evaluate_bool("data.score <= 0.5", &ctx).unwrap());
    }

    #[test]
    fn test_transforms() {
        let eval = ConditionEvaluator::new();
        let ctx = json!({"name": "  Ada ", "tags": ["x", "y"]});
        assert_eq!(eval.evaluate_value("name|trim|upper", &ctx).unwrap(), json!("ADA"));
        assert_eq!(eval.evaluate_value("tags|length", &ctx).unwrap(), json!(2.0));
        assert!(eval.evaluate_bool("tags|contains('y')", &ctx).unwrap());
        assert!(eval.evaluate_bool("name|trim|startsWith('A')", &ctx).unwrap());
    }

    #[test]
    fn test_missing_property_is_null() {
        let eval = ConditionEvaluator::new();
        let result = eval.evaluate_value("data.missing", &json!({"data": {}})).unwrap();
        assert_eq!(result, Value::Null);
    }

    #[test]
    fn test_non_object_context_rejected() {
        let eval = ConditionEvaluator::new();
        assert!(matches!(
            eval.evaluate_value("1 + 1", &json!([1])),
            Err(ExpressionError::InvalidContext(_))
        ));
    }

    #[test]
    fn default_always_holds() {
        let eval = ConditionEvaluator::new();
        assert!(condition_holds(&eval, "default", &BoundContext::default()));
        assert!(condition_holds(&eval, "  default ", &BoundContext::default()));
    }

    #[test]
    fn template_conditions_are_coerced() {
        let eval = ConditionEvaluator::new();
        let ctx = bound(json!({"flag": "Yes", "off": "no"}));
        assert!(condition_holds(&eval, "{{ flag }}", &ctx));
        assert!(!condition_holds(&eval, "{{ off }}", &ctx));
        assert!(!condition_holds(&eval, "{{ missing }}", &ctx));
    }

    #[test]
    fn malformed_expression_is_non_match() {
        let eval = ConditionEvaluator::new();
        assert!(!condition_holds(&eval, "data.score >", &bound(json!({}))));
    }

    #[test]
    fn string_results_use_boolean_coercion() {
        let eval = ConditionEvaluator::new();
        let ctx = bound(json!({"answer": "false"}));
        assert!(!condition_holds(&eval, "answer", &ctx));
    }
}
