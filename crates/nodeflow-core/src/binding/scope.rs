//! Reference resolution and per-node bound contexts.

use std::collections::HashMap;

use nodeflow_types::workflow::{NodeDefinition, split_reference};
use serde_json::{Map, Value};

use super::lookup::lookup_path;

/// Reserved bound-context key holding the workflow inputs.
pub const INPUTS_KEY: &str = "inputs";

/// Reserved bound-context key holding the injected environment.
pub const ENV_KEY: &str = "env";

/// Read-only view of everything a reference can resolve against.
///
/// Inside a fan-out item, `local` holds the outputs produced for that item
/// and shadows the parent outputs.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub outputs: &'a HashMap<String, Value>,
    pub local: Option<&'a HashMap<String, Value>>,
    pub inputs: &'a Map<String, Value>,
    pub env: &'a Map<String, Value>,
    /// `(item_name, item)` for the current fan-out item.
    pub item: Option<(&'a str, &'a Value)>,
}

impl<'a> Scope<'a> {
    pub fn new(
        outputs: &'a HashMap<String, Value>,
        inputs: &'a Map<String, Value>,
        env: &'a Map<String, Value>,
    ) -> Self {
        Self {
            outputs,
            local: None,
            inputs,
            env,
            item: None,
        }
    }

    /// Scope for one fan-out item.
    pub fn for_item(
        mut self,
        local: &'a HashMap<String, Value>,
        item_name: &'a str,
        item: &'a Value,
    ) -> Self {
        self.local = Some(local);
        self.item = Some((item_name, item));
        self
    }

    /// Output of a node, item-local first.
    pub fn output(&self, node: &str) -> Option<&'a Value> {
        self.local
            .and_then(|l| l.get(node))
            .or_else(|| self.outputs.get(node))
    }
}

/// Resolve a reference such as `fetch.body.items` or `inputs.query`.
///
/// The head segment is tried as the current item name, a node output,
/// `inputs`, `env`, and finally a bare workflow input name. The remainder is
/// looked up with [`lookup_path`]. Anything unresolvable is `None`.
pub fn resolve_reference(reference: &str, scope: &Scope<'_>) -> Option<Value> {
    let (head, rest) = split_reference(reference.trim());
    let rest = rest.unwrap_or("");

    if let Some((item_name, item)) = scope.item {
        if item_name == head {
            return lookup_path(item, rest).cloned();
        }
    }
    if let Some(output) = scope.output(head) {
        return lookup_path(output, rest).cloned();
    }
    match head {
        INPUTS_KEY => lookup_map(scope.inputs, rest),
        ENV_KEY => lookup_map(scope.env, rest),
        _ => scope
            .inputs
            .get(head)
            .and_then(|v| lookup_path(v, rest))
            .cloned(),
    }
}

fn lookup_map(map: &Map<String, Value>, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(Value::Object(map.clone()));
    }
    let (head, rest) = split_reference(path);
    map.get(head)
        .and_then(|v| lookup_path(v, rest.unwrap_or("")))
        .cloned()
}

/// The JSON object one node invocation sees.
///
/// Holds the outputs of the node's direct dependencies and of every node it
/// references (keyed by node name), the current item under its item name,
/// the workflow inputs under `inputs`, the environment under `env`, and the
/// node's explicit `context` locals, which win on collision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundContext {
    values: Map<String, Value>,
}

impl BoundContext {
    /// Build the bound context for `node` against `scope`.
    pub fn build(node: &NodeDefinition, scope: &Scope<'_>) -> Self {
        let mut values = Map::new();
        values.insert(INPUTS_KEY.to_string(), Value::Object(scope.inputs.clone()));
        values.insert(ENV_KEY.to_string(), Value::Object(scope.env.clone()));

        for dep in &node.depends_on {
            if let Some(output) = scope.output(dep) {
                values.insert(dep.clone(), output.clone());
            }
        }
        for reference in node.references() {
            let (head, _) = split_reference(reference.trim());
            if let Some(output) = scope.output(head) {
                values.insert(head.to_string(), output.clone());
            }
        }
        if let Some((item_name, item)) = scope.item {
            values.insert(item_name.to_string(), item.clone());
        }
        for (local, reference) in &node.context {
            match resolve_reference(reference, scope) {
                Some(value) => {
                    values.insert(local.clone(), value);
                }
                None => {
                    tracing::debug!(
                        node = %node.name,
                        local = %local,
                        reference = %reference,
                        "context reference did not resolve"
                    );
                }
            }
        }
        Self { values }
    }

    /// Wrap an existing object (tests and ad-hoc evaluation).
    pub fn from_map(values: Map<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Dotted-path lookup against the whole context.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let (head, rest) = split_reference(path.trim());
        self.values
            .get(head)
            .and_then(|v| lookup_path(v, rest.unwrap_or("")))
    }

    /// Resolve an `items`-style reference: a context path first, then a
    /// bare workflow input name.
    pub fn resolve(&self, reference: &str) -> Option<&Value> {
        self.lookup(reference).or_else(|| {
            self.values
                .get(INPUTS_KEY)
                .and_then(|inputs| lookup_path(inputs, reference.trim()))
        })
    }

    /// A copy with one extra binding (used per item by filter nodes).
    pub fn with_binding(&self, key: &str, value: Value) -> Self {
        let mut copy = self.clone();
        copy.values.insert(key.to_string(), value);
        copy
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.values)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeflow_types::workflow::{NodeConfig, NodeType, TransformConfig};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    fn node(depends_on: &[&str], context: &[(&str, &str)]) -> NodeDefinition {
        NodeDefinition {
            name: "n".to_string(),
            node_type: NodeType::Transform,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            config: NodeConfig::Transform(TransformConfig {
                output: Some(json!(1)),
                expression: None,
            }),
            context: context
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            timeout_secs: None,
            retry: None,
            cache: None,
            cache_ttl_secs: None,
            fallback: None,
        }
    }

    #[test]
    fn resolve_prefers_item_then_outputs_then_inputs() {
        let outputs = HashMap::from([("fetch".to_string(), json!({"body": {"n": 2}}))]);
        let inputs = obj(json!({"query": "rust", "fetch": "shadowed"}));
        let env = obj(json!({"HOME": "/root"}));
        let scope = Scope::new(&outputs, &inputs, &env);

        assert_eq!(resolve_reference("fetch.body.n", &scope), Some(json!(2)));
        assert_eq!(resolve_reference("inputs.query", &scope), Some(json!("rust")));
        assert_eq!(resolve_reference("query", &scope), Some(json!("rust")));
        assert_eq!(resolve_reference("env.HOME", &scope), Some(json!("/root")));
        assert_eq!(resolve_reference("missing.x", &scope), None);

        let local = HashMap::new();
        let item = json!({"id": 9});
        let item_scope = scope.for_item(&local, "fetch", &item);
        assert_eq!(resolve_reference("fetch.id", &item_scope), Some(json!(9)));
    }

    #[test]
    fn item_local_outputs_shadow_parent() {
        let outputs = HashMap::from([("score".to_string(), json!(1))]);
        let local = HashMap::from([("score".to_string(), json!(2))]);
        let inputs = Map::new();
        let env = Map::new();
        let item = json!(null);
        let scope = Scope::new(&outputs, &inputs, &env).for_item(&local, "item", &item);
        assert_eq!(scope.output("score"), Some(&json!(2)));
    }

    #[test]
    fn bound_context_contains_deps_locals_and_reserved_keys() {
        let outputs = HashMap::from([
            ("a".to_string(), json!({"score": 0.8})),
            ("b".to_string(), json!("unused")),
        ]);
        let inputs = obj(json!({"limit": 3}));
        let env = obj(json!({"MODE": "test"}));
        let scope = Scope::new(&outputs, &inputs, &env);
        let n = node(&["a"], &[("data", "a"), ("limit", "inputs.limit"), ("gone", "x.y")]);

        let bound = BoundContext::build(&n, &scope);
        assert_eq!(bound.get("a"), Some(&json!({"score": 0.8})));
        assert_eq!(bound.get("data"), Some(&json!({"score": 0.8})));
        assert_eq!(bound.get("limit"), Some(&json!(3)));
        assert!(bound.get("b").is_none());
        assert!(bound.get("gone").is_none());
        assert_eq!(bound.lookup("env.MODE"), Some(&json!("test")));
        assert_eq!(bound.lookup("inputs.limit"), Some(&json!(3)));
    }

    #[test]
    fn locals_override_dependency_outputs() {
        let outputs = HashMap::from([("a".to_string(), json!(1)), ("b".to_string(), json!(2))]);
        let inputs = Map::new();
        let env = Map::new();
        let scope = Scope::new(&outputs, &inputs, &env);
        let bound = BoundContext::build(&node(&["a", "b"], &[("a", "b")]), &scope);
        assert_eq!(bound.get("a"), Some(&json!(2)));
    }

    #[test]
    fn resolve_falls_back_to_bare_input_name() {
        let bound = BoundContext::from_map(obj(json!({"inputs": {"rows": [1, 2]}})));
        assert_eq!(bound.resolve("rows"), Some(&json!([1, 2])));
        assert_eq!(bound.resolve("inputs.rows"), Some(&json!([1, 2])));
        assert_eq!(bound.resolve("nope"), None);
    }
}
