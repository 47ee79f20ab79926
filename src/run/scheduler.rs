//! Dependency-driven scheduling state machine
//!
//! Tracks unresolved-predecessor counts and node statuses, hands out ready
//! nodes in deterministic order (topological rank, then lexical id), and
//! cascades skips through the successors of failed nodes. Purely
//! synchronous: the controller owns the async side.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::graph::ValidatedGraph;
use crate::run::NodeStatus;

/// Terminal outcome the controller reports back for a dispatched node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    /// The attempt ended because the run was cancelled, not a real failure
    Cancelled,
}

/// A node skipped by the cascade, with the ancestors that caused it
#[derive(Debug, Clone, PartialEq)]
pub struct Skip {
    pub node_id: Arc<str>,
    pub failed_ancestors: Vec<Arc<str>>,
}

/// Scheduling consequences of one terminal status
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Transition {
    /// Nodes that just became ready, already enqueued
    pub ready: Vec<Arc<str>>,
    /// Nodes skipped transitively, in cascade order
    pub skipped: Vec<Skip>,
}

#[derive(Debug)]
pub struct Scheduler {
    graph: Arc<ValidatedGraph>,
    statuses: FxHashMap<Arc<str>, NodeStatus>,
    /// Predecessors not yet succeeded, per pending node
    unresolved: FxHashMap<Arc<str>, usize>,
    /// Min-heap on (topological rank, lexical id) for deterministic dispatch
    queue: BinaryHeap<Reverse<(usize, Arc<str>)>>,
    /// Recorded cause for each skipped node
    failed_ancestors: FxHashMap<Arc<str>, Vec<Arc<str>>>,
}

impl Scheduler {
    pub fn new(graph: Arc<ValidatedGraph>) -> Self {
        let mut scheduler = Self {
            statuses: graph
                .nodes()
                .iter()
                .map(|n| (Arc::clone(&n.id), NodeStatus::Pending))
                .collect(),
            unresolved: graph
                .nodes()
                .iter()
                .map(|n| (Arc::clone(&n.id), graph.predecessors(&n.id).len()))
                .collect(),
            queue: BinaryHeap::new(),
            failed_ancestors: FxHashMap::default(),
            graph,
        };
        let sources: Vec<Arc<str>> = scheduler
            .unresolved
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(id, _)| Arc::clone(id))
            .collect();
        for id in sources {
            scheduler.enqueue(id);
        }
        scheduler
    }

    fn enqueue(&mut self, id: Arc<str>) {
        self.statuses.insert(Arc::clone(&id), NodeStatus::Ready);
        let rank = self.graph.rank(&id);
        self.queue.push(Reverse((rank, id)));
    }

    /// Pop the next ready node and mark it running
    pub fn pop_ready(&mut self) -> Option<Arc<str>> {
        let Reverse((_, id)) = self.queue.pop()?;
        self.statuses.insert(Arc::clone(&id), NodeStatus::Running);
        Some(id)
    }

    pub fn has_ready(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Mark a running node as waiting out a retry backoff
    pub fn mark_retrying(&mut self, id: &Arc<str>) {
        self.statuses.insert(Arc::clone(id), NodeStatus::Retrying);
    }

    /// Mark a retrying node as running its next attempt
    pub fn mark_running(&mut self, id: &Arc<str>) {
        self.statuses.insert(Arc::clone(id), NodeStatus::Running);
    }

    /// Record a terminal outcome and compute its scheduling consequences
    pub fn complete(&mut self, id: &Arc<str>, outcome: Outcome) -> Transition {
        let mut transition = Transition::default();
        match outcome {
            Outcome::Succeeded => {
                self.statuses.insert(Arc::clone(id), NodeStatus::Succeeded);
                for succ in self.graph.successors(id).to_vec() {
                    let count = self.unresolved.get_mut(&succ).map(|c| {
                        *c = c.saturating_sub(1);
                        *c
                    });
                    if count == Some(0) && self.statuses[&succ] == NodeStatus::Pending {
                        self.enqueue(Arc::clone(&succ));
                        transition.ready.push(succ);
                    }
                }
            }
            Outcome::Failed => {
                self.statuses.insert(Arc::clone(id), NodeStatus::Failed);
                self.cascade_skip(id, &mut transition);
            }
            Outcome::Cancelled => {
                // Prompt exit on cancellation counts as skipped, not failed
                self.statuses.insert(Arc::clone(id), NodeStatus::Skipped);
                self.failed_ancestors.insert(Arc::clone(id), Vec::new());
                self.cascade_skip(id, &mut transition);
            }
        }
        transition
    }

    /// Skip every pending descendant of a failed or skipped node
    fn cascade_skip(&mut self, from: &Arc<str>, transition: &mut Transition) {
        let mut frontier: Vec<Arc<str>> = self.graph.successors(from).to_vec();
        while let Some(node) = frontier.pop() {
            if self.statuses[&node] != NodeStatus::Pending {
                continue;
            }
            let ancestors = self.collect_failed_ancestors(&node);
            self.statuses.insert(Arc::clone(&node), NodeStatus::Skipped);
            self.failed_ancestors
                .insert(Arc::clone(&node), ancestors.clone());
            transition.skipped.push(Skip {
                node_id: Arc::clone(&node),
                failed_ancestors: ancestors,
            });
            frontier.extend(self.graph.successors(&node).iter().cloned());
        }
    }

    /// Failed ancestors known at skip time: failed predecessors directly,
    /// plus the recorded causes of skipped predecessors
    fn collect_failed_ancestors(&self, node: &Arc<str>) -> Vec<Arc<str>> {
        let mut ancestors: Vec<Arc<str>> = Vec::new();
        for pred in self.graph.predecessors(node) {
            match self.statuses[pred] {
                NodeStatus::Failed => ancestors.push(Arc::clone(pred)),
                NodeStatus::Skipped => {
                    if let Some(recorded) = self.failed_ancestors.get(pred) {
                        ancestors.extend(recorded.iter().cloned());
                    }
                }
                _ => {}
            }
        }
        ancestors.sort();
        ancestors.dedup();
        ancestors
    }

    /// Skip everything not yet dispatched (cancellation path)
    pub fn skip_undispatched(&mut self) -> Vec<Skip> {
        let mut skipped = Vec::new();
        let mut ids: Vec<Arc<str>> = self
            .statuses
            .iter()
            .filter(|(_, s)| matches!(s, NodeStatus::Pending | NodeStatus::Ready))
            .map(|(id, _)| Arc::clone(id))
            .collect();
        ids.sort();
        for id in ids {
            let ancestors = self.collect_failed_ancestors(&id);
            self.statuses.insert(Arc::clone(&id), NodeStatus::Skipped);
            self.failed_ancestors
                .insert(Arc::clone(&id), ancestors.clone());
            skipped.push(Skip {
                node_id: id,
                failed_ancestors: ancestors,
            });
        }
        self.queue.clear();
        skipped
    }

    pub fn status(&self, id: &str) -> Option<NodeStatus> {
        self.statuses.get(id).copied()
    }

    pub fn recorded_failed_ancestors(&self, id: &str) -> &[Arc<str>] {
        static EMPTY: &[Arc<str>] = &[];
        self.failed_ancestors
            .get(id)
            .map(|v| v.as_slice())
            .unwrap_or(EMPTY)
    }

    /// True once every node holds a terminal status
    pub fn is_complete(&self) -> bool {
        self.statuses.values().all(|s| s.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{validate, Graph};

    fn scheduler(yaml: &str) -> Scheduler {
        let graph = Graph::from_yaml(yaml).unwrap();
        Scheduler::new(Arc::new(validate(&graph).unwrap()))
    }

    const DIAMOND: &str = r#"
nodes:
  - id: a
    kind: step
    outputs: [out]
  - id: b
    kind: step
    inputs:
      x: { from: a.out }
    outputs: [out]
  - id: c
    kind: step
    inputs:
      x: { from: a.out }
    outputs: [out]
  - id: d
    kind: step
    inputs:
      l: { from: b.out }
      r: { from: c.out }
"#;

    #[test]
    fn sources_start_ready() {
        let mut s = scheduler(DIAMOND);
        assert_eq!(s.status("a"), Some(NodeStatus::Ready));
        assert_eq!(s.status("b"), Some(NodeStatus::Pending));
        assert_eq!(s.pop_ready().unwrap().as_ref(), "a");
        assert_eq!(s.status("a"), Some(NodeStatus::Running));
        assert!(s.pop_ready().is_none());
    }

    #[test]
    fn success_unlocks_successors_in_order() {
        let mut s = scheduler(DIAMOND);
        let a = s.pop_ready().unwrap();
        let t = s.complete(&a, Outcome::Succeeded);
        let mut ready: Vec<&str> = t.ready.iter().map(|r| r.as_ref()).collect();
        ready.sort();
        assert_eq!(ready, vec!["b", "c"]);

        // lexical order at equal rank
        assert_eq!(s.pop_ready().unwrap().as_ref(), "b");
        assert_eq!(s.pop_ready().unwrap().as_ref(), "c");
    }

    #[test]
    fn fan_in_waits_for_all_predecessors() {
        let mut s = scheduler(DIAMOND);
        let a = s.pop_ready().unwrap();
        s.complete(&a, Outcome::Succeeded);
        let b = s.pop_ready().unwrap();
        let c = s.pop_ready().unwrap();

        let t = s.complete(&b, Outcome::Succeeded);
        assert!(t.ready.is_empty());
        assert_eq!(s.status("d"), Some(NodeStatus::Pending));

        let t = s.complete(&c, Outcome::Succeeded);
        assert_eq!(t.ready, vec![Arc::<str>::from("d")]);
        assert!(!s.is_complete());

        let d = s.pop_ready().unwrap();
        s.complete(&d, Outcome::Succeeded);
        assert!(s.is_complete());
    }

    #[test]
    fn failure_skips_transitively_with_ancestors() {
        let mut s = scheduler(
            r#"
nodes:
  - id: a
    kind: step
    outputs: [out]
  - id: b
    kind: step
    inputs:
      x: { from: a.out }
    outputs: [out]
  - id: c
    kind: step
    inputs:
      x: { from: b.out }
"#,
        );
        let a = s.pop_ready().unwrap();
        let t = s.complete(&a, Outcome::Failed);

        assert_eq!(t.skipped.len(), 2);
        assert_eq!(s.status("b"), Some(NodeStatus::Skipped));
        assert_eq!(s.status("c"), Some(NodeStatus::Skipped));
        assert_eq!(s.recorded_failed_ancestors("b"), &[Arc::<str>::from("a")]);
        assert_eq!(s.recorded_failed_ancestors("c"), &[Arc::<str>::from("a")]);
        assert!(s.pop_ready().is_none());
        assert!(s.is_complete());
    }

    #[test]
    fn fan_in_skip_records_all_failed_ancestors() {
        let mut s = scheduler(
            r#"
nodes:
  - id: a
    kind: step
    outputs: [out]
  - id: b
    kind: step
    outputs: [out]
  - id: d
    kind: step
    inputs:
      l: { from: a.out }
      r: { from: b.out }
"#,
        );
        let first = s.pop_ready().unwrap();
        let second = s.pop_ready().unwrap();
        s.complete(&first, Outcome::Failed);
        // d already skipped by the first failure, recording a alone
        assert_eq!(s.status("d"), Some(NodeStatus::Skipped));
        assert_eq!(
            s.recorded_failed_ancestors("d"),
            &[Arc::clone(&first)]
        );
        s.complete(&second, Outcome::Failed);
        assert!(s.is_complete());
    }

    #[test]
    fn survivor_branch_keeps_running_after_failure() {
        let mut s = scheduler(DIAMOND);
        let a = s.pop_ready().unwrap();
        s.complete(&a, Outcome::Succeeded);
        let b = s.pop_ready().unwrap();
        let c = s.pop_ready().unwrap();

        s.complete(&b, Outcome::Failed);
        assert_eq!(s.status("d"), Some(NodeStatus::Skipped));
        // c is already running and keeps its slot
        assert_eq!(s.status("c"), Some(NodeStatus::Running));
        s.complete(&c, Outcome::Succeeded);
        assert!(s.is_complete());
    }

    #[test]
    fn cancelled_outcome_is_a_skip() {
        let mut s = scheduler(DIAMOND);
        let a = s.pop_ready().unwrap();
        s.complete(&a, Outcome::Cancelled);
        assert_eq!(s.status("a"), Some(NodeStatus::Skipped));
        assert!(s.recorded_failed_ancestors("a").is_empty());
        assert_eq!(s.status("d"), Some(NodeStatus::Skipped));
    }

    #[test]
    fn skip_undispatched_clears_the_queue() {
        let mut s = scheduler(DIAMOND);
        let skipped = s.skip_undispatched();
        // deterministic lexical order
        let ids: Vec<&str> = skipped.iter().map(|sk| sk.node_id.as_ref()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        assert!(s.pop_ready().is_none());
        assert!(s.is_complete());
    }

    #[test]
    fn retry_statuses_round_trip() {
        let mut s = scheduler(DIAMOND);
        let a = s.pop_ready().unwrap();
        s.mark_retrying(&a);
        assert_eq!(s.status("a"), Some(NodeStatus::Retrying));
        s.mark_running(&a);
        assert_eq!(s.status("a"), Some(NodeStatus::Running));
    }
}
