//! DAG validation, execution order and parallel waves.
//!
//! Uses `petgraph` to model `depends_on` edges and detect cycles. The total
//! order comes from Kahn's algorithm with ties broken by declaration order,
//! so the same document always yields the same order. Depth-based grouping
//! produces the parallel waves shown by `nodeflow plan`.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use nodeflow_types::workflow::{NodeConfig, NodeDefinition, NodeType, WorkflowDefinition, split_reference};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use super::definition::WorkflowError;
use crate::binding::scope::{ENV_KEY, INPUTS_KEY};

/// A valid schedule for a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOrder {
    /// Every node after all of its dependencies.
    pub order: Vec<String>,
    /// Nodes grouped by dependency depth; a wave only depends on earlier ones.
    pub waves: Vec<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate the node graph and compute its execution order.
///
/// Fails on:
/// - a `depends_on` entry naming no node (`UnknownDependency`)
/// - a cycle, self-dependency included (`CycleDetected`, naming a node on it)
/// - a context, config, output, route target, subgraph or aggregate source
///   reference that resolves to nothing (`DanglingReference`)
/// - a context reference to a node that is not upstream, a node in two
///   fan-out subgraphs, nested fan-out, or a route target that does not
///   depend on its router (`ValidationError`)
pub fn validate(def: &WorkflowDefinition) -> Result<ExecutionOrder, WorkflowError> {
    let index: HashMap<&str, usize> = def
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.name.as_str(), i))
        .collect();

    check_dependencies(def, &index)?;
    check_acyclic(def, &index)?;
    let owners = check_subgraphs(def, &index)?;
    check_references(def, &index, &owners)?;

    let order = kahn_order(def, &index);
    let waves = waves(def, &order);
    Ok(ExecutionOrder { order, waves })
}

fn check_dependencies(def: &WorkflowDefinition, index: &HashMap<&str, usize>) -> Result<(), WorkflowError> {
    for node in &def.nodes {
        for dep in &node.depends_on {
            if !index.contains_key(dep.as_str()) {
                return Err(WorkflowError::UnknownDependency {
                    node: node.name.clone(),
                    reference: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

fn check_acyclic(def: &WorkflowDefinition, index: &HashMap<&str, usize>) -> Result<(), WorkflowError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = def.nodes.iter().map(|n| graph.add_node(n.name.as_str())).collect();

    for node in &def.nodes {
        let to = index[node.name.as_str()];
        for dep in &node.depends_on {
            if dep == &node.name {
                return Err(WorkflowError::CycleDetected {
                    node: node.name.clone(),
                });
            }
            graph.add_edge(node_indices[index[dep.as_str()]], node_indices[to], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| WorkflowError::CycleDetected {
        node: graph[cycle.node_id()].to_string(),
    })?;
    Ok(())
}

/// Check fan-out subgraphs and return member -> owning expander.
fn check_subgraphs<'a>(
    def: &'a WorkflowDefinition,
    index: &HashMap<&str, usize>,
) -> Result<HashMap<&'a str, &'a str>, WorkflowError> {
    let mut owners: HashMap<&str, &str> = HashMap::new();
    for expander in def.nodes.iter().filter(|n| n.node_type.is_expander()) {
        for member in expansion_subgraph(def, expander) {
            let Some(&i) = index.get(member) else {
                return Err(WorkflowError::DanglingReference {
                    location: format!("subgraph of node '{}'", expander.name),
                    reference: member.to_string(),
                });
            };
            let member_def = &def.nodes[i];
            if member_def.name == expander.name || member_def.node_type.is_expander() {
                return Err(WorkflowError::ValidationError(format!(
                    "node '{}' cannot run inside the fan-out of '{}' (nested fan-out is not supported)",
                    member, expander.name
                )));
            }
            if let Some(previous) = owners.insert(member_def.name.as_str(), expander.name.as_str()) {
                if previous != expander.name {
                    return Err(WorkflowError::ValidationError(format!(
                        "node '{}' belongs to the subgraphs of both '{}' and '{}'",
                        member, previous, expander.name
                    )));
                }
            }
        }
    }

    // External dependencies of a subgraph must not wait on the subgraph.
    for expander in def.nodes.iter().filter(|n| n.node_type.is_expander()) {
        let members: HashSet<&str> = expansion_subgraph(def, expander).into_iter().collect();
        for member in &members {
            let node = &def.nodes[index[member]];
            for dep in &node.depends_on {
                let dep = dep.as_str();
                if dep == expander.name || members.contains(dep) {
                    continue;
                }
                if ancestors(def, index, dep).iter().any(|a| members.contains(a)) {
                    return Err(WorkflowError::ValidationError(format!(
                        "node '{}' depends on '{}', which waits on the fan-out of '{}'",
                        member, dep, expander.name
                    )));
                }
            }
        }
    }
    Ok(owners)
}

fn check_references(
    def: &WorkflowDefinition,
    index: &HashMap<&str, usize>,
    owners: &HashMap<&str, &str>,
) -> Result<(), WorkflowError> {
    for node in &def.nodes {
        let owner = owners.get(node.name.as_str()).map(|o| &def.nodes[index[o]]);
        let item_name = owner.and_then(|o| expander_item_name(&o.config));

        let mut upstream = ancestors(def, index, &node.name);
        if let Some(owner) = owner {
            upstream.insert(owner.name.as_str());
            upstream.extend(ancestors(def, index, &owner.name));
        }

        for reference in node.references() {
            let (head, _) = split_reference(reference.trim());
            if Some(head) == item_name {
                continue;
            }
            if index.contains_key(head) {
                if !upstream.contains(head) {
                    return Err(WorkflowError::ValidationError(format!(
                        "node '{}' references '{}', which is not upstream of it",
                        node.name, head
                    )));
                }
                continue;
            }
            if head == INPUTS_KEY || head == ENV_KEY || def.inputs.contains_key(head) {
                continue;
            }
            return Err(WorkflowError::DanglingReference {
                location: format!("node '{}'", node.name),
                reference: reference.to_string(),
            });
        }

        match &node.config {
            NodeConfig::Conditional(route) | NodeConfig::Route(route) => {
                for target in route.targets() {
                    let Some(&i) = index.get(target) else {
                        return Err(WorkflowError::DanglingReference {
                            location: format!("route target of node '{}'", node.name),
                            reference: target.to_string(),
                        });
                    };
                    if !def.nodes[i].depends_on.contains(&node.name) {
                        return Err(WorkflowError::ValidationError(format!(
                            "route target '{}' of node '{}' must depend on it",
                            target, node.name
                        )));
                    }
                }
            }
            NodeConfig::Aggregate(agg) => {
                if let Some(source) = &agg.source {
                    let is_expander = index
                        .get(source.as_str())
                        .is_some_and(|&i| def.nodes[i].node_type.is_expander());
                    if !is_expander {
                        return Err(WorkflowError::DanglingReference {
                            location: format!("aggregate source of node '{}'", node.name),
                            reference: source.clone(),
                        });
                    }
                }
            }
            _ => {}
        }
    }

    for (name, reference) in &def.outputs {
        let (head, _) = split_reference(reference.trim());
        if !index.contains_key(head) {
            return Err(WorkflowError::DanglingReference {
                location: format!("output '{name}'"),
                reference: reference.clone(),
            });
        }
    }
    Ok(())
}

fn expander_item_name(config: &NodeConfig) -> Option<&str> {
    match config {
        NodeConfig::Split(c) => Some(c.item_name.as_str()),
        NodeConfig::Foreach(c) => Some(c.item_name.as_str()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Graph helpers
// ---------------------------------------------------------------------------

/// Nodes an expander runs once per item.
///
/// Split: its direct dependents that are not aggregate nodes, in
/// declaration order. Foreach: its declared `subgraph`.
pub fn expansion_subgraph<'a>(def: &'a WorkflowDefinition, expander: &'a NodeDefinition) -> Vec<&'a str> {
    match &expander.config {
        NodeConfig::Split(_) => def
            .nodes
            .iter()
            .filter(|n| n.node_type != NodeType::Aggregate && n.depends_on.contains(&expander.name))
            .map(|n| n.name.as_str())
            .collect(),
        NodeConfig::Foreach(c) => c.subgraph.iter().map(String::as_str).collect(),
        _ => Vec::new(),
    }
}

/// Transitive `depends_on` closure of a node (excluding itself).
pub fn ancestors<'a>(def: &'a WorkflowDefinition, index: &HashMap<&str, usize>, node: &str) -> HashSet<&'a str> {
    let mut visited = HashSet::new();
    let mut stack: Vec<&str> = vec![node];
    while let Some(current) = stack.pop() {
        let Some(&i) = index.get(current) else {
            continue;
        };
        for dep in &def.nodes[i].depends_on {
            if visited.insert(dep.as_str()) {
                stack.push(dep.as_str());
            }
        }
    }
    visited
}

/// Kahn's algorithm; among ready nodes the earliest declared goes first.
fn kahn_order(def: &WorkflowDefinition, index: &HashMap<&str, usize>) -> Vec<String> {
    let mut indegree: Vec<usize> = def.nodes.iter().map(|n| n.depends_on.iter().collect::<BTreeSet<_>>().len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); def.nodes.len()];
    for (i, node) in def.nodes.iter().enumerate() {
        for dep in node.depends_on.iter().collect::<BTreeSet<_>>() {
            dependents[index[dep.as_str()]].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(def.nodes.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(def.nodes[i].name.clone());
        for &next in &dependents[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }
    order
}

/// Group nodes by depth (longest dependency chain from a root).
fn waves(def: &WorkflowDefinition, order: &[String]) -> Vec<Vec<String>> {
    let by_name: HashMap<&str, &NodeDefinition> = def.nodes.iter().map(|n| (n.name.as_str(), n)).collect();
    let mut depths: HashMap<&str, usize> = HashMap::new();
    for name in order {
        let node = by_name[name.as_str()];
        let depth = node
            .depends_on
            .iter()
            .map(|dep| depths.get(dep.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(name.as_str(), depth);
    }

    let max_depth = depths.values().copied().max().unwrap_or(0);
    let mut waves: Vec<Vec<String>> = vec![Vec::new(); if order.is_empty() { 0 } else { max_depth + 1 }];
    for node in &def.nodes {
        if let Some(&depth) = depths.get(node.name.as_str()) {
            waves[depth].push(node.name.clone());
        }
    }
    waves
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
