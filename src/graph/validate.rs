//! Graph validation: structural invariants checked before any node runs
//!
//! Checks, in order: settings sanity, id uniqueness, output declarations,
//! binding references (existing node, declared port, no self-reference),
//! edge endpoints, and acyclicity. A cycle is reported with the full list
//! of node ids on it. Validation has no side effects and is idempotent.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::ConfigError;
use crate::graph::node::{Graph, Node};
use crate::settings::RunSettings;

/// Graph that passed validation, with precomputed scheduling structure
#[derive(Debug, Clone)]
pub struct ValidatedGraph {
    graph: Graph,
    /// node id -> direct predecessors, sorted for deterministic iteration
    predecessors: FxHashMap<Arc<str>, Vec<Arc<str>>>,
    /// node id -> direct successors, sorted for deterministic iteration
    successors: FxHashMap<Arc<str>, Vec<Arc<str>>>,
    /// node id -> topological rank (longest path from a source node).
    /// A scheduling hint only: equal-rank siblings may run concurrently.
    ranks: FxHashMap<Arc<str>, usize>,
}

impl ValidatedGraph {
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.graph.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Arc<Node>> {
        self.graph.node(id)
    }

    pub fn settings(&self) -> &RunSettings {
        &self.graph.settings
    }

    pub fn predecessors(&self, id: &str) -> &[Arc<str>] {
        static EMPTY: &[Arc<str>] = &[];
        self.predecessors
            .get(id)
            .map(|v| v.as_slice())
            .unwrap_or(EMPTY)
    }

    pub fn successors(&self, id: &str) -> &[Arc<str>] {
        static EMPTY: &[Arc<str>] = &[];
        self.successors
            .get(id)
            .map(|v| v.as_slice())
            .unwrap_or(EMPTY)
    }

    pub fn rank(&self, id: &str) -> usize {
        self.ranks.get(id).copied().unwrap_or(0)
    }
}

/// Validate a graph, producing the precomputed structure the scheduler needs
pub fn validate(graph: &Graph) -> Result<ValidatedGraph, ConfigError> {
    graph.settings.validate()?;

    // Id uniqueness
    let mut ids: FxHashSet<&str> = FxHashSet::default();
    for node in &graph.nodes {
        if !ids.insert(node.id.as_ref()) {
            return Err(ConfigError::DuplicateNodeId {
                node_id: Arc::clone(&node.id),
            });
        }
    }

    // Output port declarations
    for node in &graph.nodes {
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        for port in &node.outputs {
            if !seen.insert(port.name.as_ref()) {
                return Err(ConfigError::DuplicateOutputPort {
                    node_id: Arc::clone(&node.id),
                    port: Arc::clone(&port.name),
                });
            }
        }
    }

    let by_id: FxHashMap<&str, &Arc<Node>> =
        graph.nodes.iter().map(|n| (n.id.as_ref(), n)).collect();

    // Binding references resolve to an existing node and a declared port
    for node in &graph.nodes {
        for (input, binding) in &node.inputs {
            let Some(port_ref) = binding.source() else {
                continue;
            };
            if port_ref.node == node.id {
                return Err(ConfigError::SelfReference {
                    node_id: Arc::clone(&node.id),
                    input: Arc::clone(input),
                });
            }
            let Some(upstream) = by_id.get(port_ref.node.as_ref()) else {
                return Err(ConfigError::UnknownBindingNode {
                    node_id: Arc::clone(&node.id),
                    input: Arc::clone(input),
                    referenced: Arc::clone(&port_ref.node),
                });
            };
            if !upstream.declares_output(&port_ref.port) {
                return Err(ConfigError::UnknownBindingPort {
                    node_id: Arc::clone(&node.id),
                    input: Arc::clone(input),
                    referenced: Arc::clone(&port_ref.node),
                    port: Arc::clone(&port_ref.port),
                });
            }
        }
    }

    // Explicit edges must name known nodes
    for edge in &graph.edges {
        for end in [&edge.from, &edge.to] {
            if !by_id.contains_key(end.as_ref()) {
                return Err(ConfigError::UnknownEdgeNode {
                    node_id: Arc::clone(end),
                });
            }
        }
    }

    // Dependency relation: binding-derived edges merged with explicit ones
    let mut pred_sets: FxHashMap<Arc<str>, FxHashSet<Arc<str>>> = FxHashMap::default();
    let mut succ_sets: FxHashMap<Arc<str>, FxHashSet<Arc<str>>> = FxHashMap::default();
    for node in &graph.nodes {
        pred_sets.insert(Arc::clone(&node.id), FxHashSet::default());
        succ_sets.insert(Arc::clone(&node.id), FxHashSet::default());
    }
    let mut add_edge = |from: &Arc<str>, to: &Arc<str>| {
        if from != to {
            if let Some(preds) = pred_sets.get_mut(to) {
                preds.insert(Arc::clone(from));
            }
            if let Some(succs) = succ_sets.get_mut(from) {
                succs.insert(Arc::clone(to));
            }
        }
    };
    for node in &graph.nodes {
        for referenced in node.referenced_nodes() {
            // Arc reuse: take the id owned by the upstream node itself
            let from = Arc::clone(&by_id[referenced.as_ref()].id);
            add_edge(&from, &node.id);
        }
    }
    for edge in &graph.edges {
        let from = Arc::clone(&by_id[edge.from.as_ref()].id);
        let to = Arc::clone(&by_id[edge.to.as_ref()].id);
        add_edge(&from, &to);
    }

    let ranks = topological_ranks(graph, &pred_sets, &succ_sets)?;

    let sorted = |sets: FxHashMap<Arc<str>, FxHashSet<Arc<str>>>| {
        sets.into_iter()
            .map(|(id, set)| {
                let mut v: Vec<Arc<str>> = set.into_iter().collect();
                v.sort();
                (id, v)
            })
            .collect::<FxHashMap<_, _>>()
    };

    Ok(ValidatedGraph {
        graph: graph.clone(),
        predecessors: sorted(pred_sets),
        successors: sorted(succ_sets),
        ranks,
    })
}

/// Kahn's algorithm: assigns ranks and rejects cycles with the full path
fn topological_ranks(
    graph: &Graph,
    pred_sets: &FxHashMap<Arc<str>, FxHashSet<Arc<str>>>,
    succ_sets: &FxHashMap<Arc<str>, FxHashSet<Arc<str>>>,
) -> Result<FxHashMap<Arc<str>, usize>, ConfigError> {
    let mut in_degree: FxHashMap<&str, usize> = graph
        .nodes
        .iter()
        .map(|n| (n.id.as_ref(), pred_sets[&n.id].len()))
        .collect();

    let mut ranks: FxHashMap<Arc<str>, usize> = FxHashMap::default();
    let mut queue: Vec<&Arc<Node>> = graph
        .nodes
        .iter()
        .filter(|n| in_degree[n.id.as_ref()] == 0)
        .collect();

    for node in &queue {
        ranks.insert(Arc::clone(&node.id), 0);
    }

    let by_id: FxHashMap<&str, &Arc<Node>> =
        graph.nodes.iter().map(|n| (n.id.as_ref(), n)).collect();

    let mut visited = 0usize;
    while let Some(node) = queue.pop() {
        visited += 1;
        let rank = ranks[&node.id];
        for succ in &succ_sets[&node.id] {
            let entry = ranks.entry(Arc::clone(succ)).or_insert(0);
            *entry = (*entry).max(rank + 1);
            let Some(deg) = in_degree.get_mut(succ.as_ref()) else {
                continue;
            };
            *deg -= 1;
            if *deg == 0 {
                queue.push(by_id[succ.as_ref()]);
            }
        }
    }

    if visited != graph.nodes.len() {
        let remaining: FxHashSet<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg > 0)
            .map(|(&id, _)| id)
            .collect();
        return Err(ConfigError::Cycle {
            nodes: extract_cycle(graph, succ_sets, &remaining),
        });
    }

    Ok(ranks)
}

/// DFS over the unresolved remainder to recover one concrete cycle path
fn extract_cycle(
    graph: &Graph,
    succ_sets: &FxHashMap<Arc<str>, FxHashSet<Arc<str>>>,
    remaining: &FxHashSet<&str>,
) -> Vec<Arc<str>> {
    let mut on_path: Vec<Arc<str>> = Vec::new();
    let mut on_path_set: FxHashSet<Arc<str>> = FxHashSet::default();
    let mut done: FxHashSet<Arc<str>> = FxHashSet::default();

    // (node, next successor index) stack for iterative DFS
    for start in graph.nodes.iter().filter(|n| remaining.contains(n.id.as_ref())) {
        if done.contains(&start.id) {
            continue;
        }
        let mut stack: Vec<(Arc<str>, Vec<Arc<str>>, usize)> = Vec::new();
        let mut succs: Vec<Arc<str>> = succ_sets[&start.id]
            .iter()
            .filter(|s| remaining.contains(s.as_ref()))
            .cloned()
            .collect();
        succs.sort();
        stack.push((Arc::clone(&start.id), succs, 0));
        on_path.push(Arc::clone(&start.id));
        on_path_set.insert(Arc::clone(&start.id));

        while let Some((node, succs, idx)) = stack.last_mut() {
            if *idx >= succs.len() {
                done.insert(Arc::clone(node));
                on_path_set.remove(node);
                on_path.pop();
                stack.pop();
                continue;
            }
            let next = Arc::clone(&succs[*idx]);
            *idx += 1;

            if on_path_set.contains(&next) {
                // Back edge: the cycle is the path suffix starting at `next`
                let pos = on_path.iter().position(|n| *n == next).unwrap_or(0);
                return on_path[pos..].to_vec();
            }
            if done.contains(&next) {
                continue;
            }
            let mut next_succs: Vec<Arc<str>> = succ_sets[&next]
                .iter()
                .filter(|s| remaining.contains(s.as_ref()))
                .cloned()
                .collect();
            next_succs.sort();
            on_path.push(Arc::clone(&next));
            on_path_set.insert(Arc::clone(&next));
            stack.push((next, next_succs, 0));
        }
    }

    // Unreachable for a genuine cycle, but keep diagnostics non-panicking
    remaining.iter().map(|&s| Arc::from(s)).collect()
}
