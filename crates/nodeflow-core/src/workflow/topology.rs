//! Graph facts the scheduler consults on every step, computed once per
//! definition: fan-out subgraphs and their sinks, external dependencies and
//! aggregate pairing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nodeflow_types::workflow::{NodeConfig, NodeDefinition, WorkflowDefinition};

use super::dag::{self, ExecutionOrder};
use super::definition::WorkflowError;

#[derive(Debug, Clone)]
pub struct Topology {
    /// Every node, in execution order.
    pub order: Vec<String>,
    pub waves: Vec<Vec<String>>,
    nodes: HashMap<String, Arc<NodeDefinition>>,
    /// Subgraph member -> owning expander.
    owner: HashMap<String, String>,
    /// Expander -> members in execution order.
    subgraphs: HashMap<String, Vec<String>>,
    sinks: HashMap<String, Vec<String>>,
    /// Expander -> dependencies of its members that live outside the subgraph.
    external_deps: HashMap<String, Vec<String>>,
    /// Aggregate -> expander whose per-item results it collects.
    aggregate_source: HashMap<String, String>,
}

impl Topology {
    /// Validate `def` and precompute its scheduling facts.
    pub fn build(def: &WorkflowDefinition) -> Result<Self, WorkflowError> {
        let ExecutionOrder { order, waves } = dag::validate(def)?;
        let position: HashMap<&str, usize> = order.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();

        let nodes: HashMap<String, Arc<NodeDefinition>> = def
            .nodes
            .iter()
            .map(|n| (n.name.clone(), Arc::new(n.clone())))
            .collect();

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for node in &def.nodes {
            for dep in &node.depends_on {
                let entry = dependents.entry(dep.clone()).or_default();
                if !entry.contains(&node.name) {
                    entry.push(node.name.clone());
                }
            }
        }

        let mut owner = HashMap::new();
        let mut subgraphs = HashMap::new();
        let mut sinks = HashMap::new();
        let mut external_deps = HashMap::new();
        for expander in def.nodes.iter().filter(|n| n.node_type.is_expander()) {
            let mut members: Vec<String> = dag::expansion_subgraph(def, expander)
                .into_iter()
                .map(str::to_string)
                .collect();
            members.sort_by_key(|m| position.get(m.as_str()).copied().unwrap_or(usize::MAX));
            members.dedup();
            let member_set: HashSet<&str> = members.iter().map(String::as_str).collect();

            let member_sinks: Vec<String> = members
                .iter()
                .filter(|m| {
                    !dependents
                        .get(m.as_str())
                        .is_some_and(|ds| ds.iter().any(|d| member_set.contains(d.as_str())))
                })
                .cloned()
                .collect();

            let mut externals: Vec<String> = Vec::new();
            for member in &members {
                for dep in &nodes[member].depends_on {
                    if dep != &expander.name && !member_set.contains(dep.as_str()) && !externals.contains(dep) {
                        externals.push(dep.clone());
                    }
                }
            }

            for member in &members {
                owner.insert(member.clone(), expander.name.clone());
            }
            sinks.insert(expander.name.clone(), member_sinks);
            external_deps.insert(expander.name.clone(), externals);
            subgraphs.insert(expander.name.clone(), members);
        }

        let mut aggregate_source = HashMap::new();
        for node in &def.nodes {
            if let NodeConfig::Aggregate(config) = &node.config {
                let source = config.source.clone().or_else(|| paired_expander(node, &sinks));
                if let Some(source) = source {
                    aggregate_source.insert(node.name.clone(), source);
                }
            }
        }

        Ok(Self {
            order,
            waves,
            nodes,
            owner,
            subgraphs,
            sinks,
            external_deps,
            aggregate_source,
        })
    }

    pub fn node(&self, name: &str) -> Option<&Arc<NodeDefinition>> {
        self.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The expander that runs `name` once per item, if any.
    pub fn owner(&self, name: &str) -> Option<&str> {
        self.owner.get(name).map(String::as_str)
    }

    pub fn subgraph(&self, expander: &str) -> &[String] {
        self.subgraphs.get(expander).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn sinks(&self, expander: &str) -> &[String] {
        self.sinks.get(expander).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn external_deps(&self, expander: &str) -> &[String] {
        self.external_deps.get(expander).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn aggregate_source(&self, aggregate: &str) -> Option<&str> {
        self.aggregate_source.get(aggregate).map(String::as_str)
    }
}

/// The first dependency of `aggregate` that is an expander, or a sink of
/// one, names the expander whose per-item results it collects. Anything
/// further upstream is not paired; the aggregate then reads its
/// dependencies' outputs instead.
fn paired_expander(aggregate: &NodeDefinition, sinks: &HashMap<String, Vec<String>>) -> Option<String> {
    aggregate.depends_on.iter().find_map(|dep| {
        if sinks.contains_key(dep) {
            return Some(dep.clone());
        }
        sinks
            .iter()
            .find(|(_, expander_sinks)| expander_sinks.contains(dep))
            .map(|(expander, _)| expander.clone())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::parse_workflow;

    const FANOUT: &str = r#"
name: fan
inputs:
  urls: { type: array }
  prefix: { type: string, default: ">" }
nodes:
  split:
    type: split
    config: { items: urls, item_name: url }
  fetch:
    type: transform
    depends_on: [split]
    context: { u: url }
    config: { output: "{{ u }}" }
  label:
    type: transform
    depends_on: [fetch]
    config: { output: "{{ fetch }}" }
  collect:
    type: aggregate
    depends_on: [label]
outputs:
  all: collect
"#;

    #[test]
    fn subgraph_sinks_and_pairing() {
        let def = parse_workflow(FANOUT).unwrap();
        let topo = Topology::build(&def).unwrap();
        // Only direct dependents of a split run per item.
        assert_eq!(topo.subgraph("split"), ["fetch".to_string()]);
        assert_eq!(topo.owner("fetch"), Some("split"));
        assert_eq!(topo.owner("label"), None);
        assert_eq!(topo.sinks("split"), ["fetch".to_string()]);
        // `collect` hangs off `label`, which runs once; it is not paired.
        assert_eq!(topo.aggregate_source("collect"), None);
    }

    #[test]
    fn aggregate_pairs_with_expander_or_its_sink() {
        let def = parse_workflow(
            r#"
name: pairs
inputs:
  xs: { type: array }
nodes:
  split:
    type: split
    config: { items: xs }
  work:
    type: transform
    depends_on: [split]
    config: { output: "{{ item }}" }
  by_sink:
    type: aggregate
    depends_on: [work]
  by_expander:
    type: aggregate
    depends_on: [split]
"#,
        )
        .unwrap();
        let topo = Topology::build(&def).unwrap();
        assert_eq!(topo.aggregate_source("by_sink"), Some("split"));
        assert_eq!(topo.aggregate_source("by_expander"), Some("split"));
    }

    #[test]
    fn foreach_subgraph_in_execution_order() {
        let def = parse_workflow(
            r#"
name: fe
inputs:
  xs: { type: array }
nodes:
  loop:
    type: foreach
    config: { items: xs, subgraph: [second, first] }
  first:
    type: transform
    depends_on: [loop]
    config: { output: "{{ item }}" }
  second:
    type: transform
    depends_on: [first]
    config: { output: "{{ first }}" }
  gather:
    type: aggregate
    depends_on: [second]
    config: { source: loop }
"#,
        )
        .unwrap();
        let topo = Topology::build(&def).unwrap();
        assert_eq!(topo.subgraph("loop"), ["first".to_string(), "second".to_string()]);
        assert_eq!(topo.sinks("loop"), ["second".to_string()]);
        assert!(topo.external_deps("loop").is_empty());
        assert_eq!(topo.aggregate_source("gather"), Some("loop"));
    }
}
