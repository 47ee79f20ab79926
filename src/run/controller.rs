//! Run controller: drives one graph from start to final report
//!
//! Owns the state store, event log, and cancellation token for a single
//! run. Dispatch draws ready nodes from the scheduler up to the
//! concurrency budget and collects supervisor outcomes with a `JoinSet`.
//! Node failures never abort the run; only configuration problems and API
//! misuse surface as errors.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{ConfigError, NodeError, RunError};
use crate::event::{EventKind, EventLog};
use crate::graph::ValidatedGraph;
use crate::handler::HandlerRegistry;
use crate::run::scheduler::{Outcome, Scheduler, Skip};
use crate::run::supervisor::{
    Bootstrap, NodeOutcome, Supervisor, DEFAULT_CANCEL_GRACE,
};
use crate::run::NodeStatus;
use crate::settings::RunSettings;
use crate::store::StateStore;

/// Overall result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No node terminally failed; cancellation skips alone stay completed
    Completed,
    /// At least one node terminally failed
    Failed,
}

/// Final record for one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node_id: Arc<str>,
    pub status: NodeStatus,
    pub attempts: u32,
    pub error: Option<String>,
    /// For skipped nodes: the failed ancestors that caused the skip
    pub failed_ancestors: Vec<Arc<str>>,
    /// Offsets from run start (ms); `None` for nodes never dispatched
    pub started_at_ms: Option<u64>,
    pub finished_at_ms: Option<u64>,
    pub duration_ms: u64,
}

/// Final report handed back by [`Run::run`]
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Arc<str>,
    pub status: RunStatus,
    /// Whether the run was cancelled before completion
    pub cancelled: bool,
    pub duration_ms: u64,
    /// One entry per node, in graph declaration order
    pub nodes: Vec<NodeReport>,
    /// Outputs of every succeeded node: node -> port -> value
    pub outputs: BTreeMap<Arc<str>, BTreeMap<Arc<str>, Value>>,
}

impl RunReport {
    pub fn node(&self, id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.node_id.as_ref() == id)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// One execution of one validated graph. Executes exactly once.
pub struct Run {
    graph: Arc<ValidatedGraph>,
    registry: HandlerRegistry,
    settings: RunSettings,
    bootstrap: Bootstrap,
    cancel: CancellationToken,
    grace: Duration,
    events: EventLog,
    run_id: Arc<str>,
    started: AtomicBool,
}

impl Run {
    pub fn new(graph: ValidatedGraph, registry: HandlerRegistry) -> Self {
        let run_id: Arc<str> = Arc::from(Uuid::new_v4().to_string());
        let settings = graph.settings().clone();
        Self {
            graph: Arc::new(graph),
            registry,
            settings,
            bootstrap: Bootstrap::default(),
            cancel: CancellationToken::new(),
            grace: DEFAULT_CANCEL_GRACE,
            events: EventLog::new(Arc::clone(&run_id)),
            run_id,
            started: AtomicBool::new(false),
        }
    }

    /// Replace the graph's settings for this run
    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Feed an externally supplied value into one input port.
    ///
    /// Overlaid on input resolution at dispatch time; never enters the
    /// state store.
    pub fn with_bootstrap(
        mut self,
        node_id: impl Into<Arc<str>>,
        port: impl Into<Arc<str>>,
        value: Value,
    ) -> Self {
        self.bootstrap
            .entry(node_id.into())
            .or_default()
            .insert(port.into(), value);
        self
    }

    /// Shrink (or stretch) the grace a cancelled handler gets to return
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn run_id(&self) -> &Arc<str> {
        &self.run_id
    }

    /// Event log for inspection or live subscription
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Request cancellation: running handlers get the grace period,
    /// undispatched nodes are skipped
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token observers can use to cancel from elsewhere
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute the graph to completion. A second call fails synchronously.
    #[instrument(skip(self), fields(run_id = %self.run_id))]
    pub async fn run(&self) -> Result<RunReport, RunError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RunError::AlreadyStarted);
        }
        self.settings.validate().map_err(RunError::Config)?;
        self.registry.resolve_all(&self.graph)?;

        let run_start = Instant::now();
        self.events.mark_start();
        info!(nodes = self.graph.nodes().len(), "starting run");
        self.events.emit(EventKind::RunStarted {
            node_count: self.graph.nodes().len(),
        });

        let store = Arc::new(StateStore::new(&self.graph));
        let scheduler = Arc::new(Mutex::new(Scheduler::new(Arc::clone(&self.graph))));
        let bootstrap = Arc::new(self.bootstrap.clone());

        // terminal outcome per dispatched node
        let mut records: FxHashMap<Arc<str>, NodeOutcome> = FxHashMap::default();
        let mut join_set: JoinSet<NodeOutcome> = JoinSet::new();
        let mut in_flight: FxHashMap<tokio::task::Id, Arc<str>> = FxHashMap::default();
        let mut cancelled = false;

        loop {
            if !cancelled {
                while join_set.len() < self.settings.concurrency {
                    let next = scheduler.lock().pop_ready();
                    let Some(node_id) = next else { break };
                    let task_id = self.dispatch(
                        &node_id,
                        &mut join_set,
                        &store,
                        &scheduler,
                        &bootstrap,
                    )?;
                    in_flight.insert(task_id, node_id);
                }
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    warn!("cancellation requested, draining in-flight nodes");
                    let skips = scheduler.lock().skip_undispatched();
                    self.emit_skips(&skips);
                }
                Some(joined) = join_set.join_next_with_id() => {
                    match joined {
                        Ok((task_id, outcome)) => {
                            in_flight.remove(&task_id);
                            self.settle(outcome, &scheduler, &mut records);
                        }
                        Err(join_err) => {
                            // A panicking handler fails its node
                            let node_id = in_flight
                                .remove(&join_err.id())
                                .unwrap_or_else(|| Arc::from("unknown"));
                            warn!(node = %node_id, "handler task panicked");
                            let now = self.events.elapsed_ms();
                            let outcome = NodeOutcome {
                                node_id,
                                attempts: 1,
                                error: Some(NodeError::Handler {
                                    message: format!("handler panicked: {join_err}"),
                                    retryable: false,
                                }),
                                started_at_ms: now,
                                finished_at_ms: now,
                            };
                            self.settle(outcome, &scheduler, &mut records);
                        }
                    }
                }
            }
        }

        let report = self.assemble_report(
            run_start,
            cancelled,
            &scheduler.lock(),
            &store,
            &records,
        );
        self.events.emit(EventKind::RunFinished {
            completed: report.status == RunStatus::Completed,
            cancelled,
            duration_ms: report.duration_ms,
        });
        info!(status = ?report.status, cancelled, "run finished");
        Ok(report)
    }

    /// Spawn one supervisor for a ready node
    fn dispatch(
        &self,
        node_id: &Arc<str>,
        join_set: &mut JoinSet<NodeOutcome>,
        store: &Arc<StateStore>,
        scheduler: &Arc<Mutex<Scheduler>>,
        bootstrap: &Arc<Bootstrap>,
    ) -> Result<tokio::task::Id, RunError> {
        let node = self
            .graph
            .node(node_id)
            .map(Arc::clone)
            .ok_or_else(|| ConfigError::UnknownEdgeNode {
                node_id: Arc::clone(node_id),
            })?;
        let handler = self
            .registry
            .resolve(&node.kind)
            .ok_or_else(|| ConfigError::UnknownHandler {
                node_id: Arc::clone(&node.id),
                kind: Arc::clone(&node.kind),
            })?;

        self.events.emit(EventKind::NodeScheduled {
            node_id: Arc::clone(node_id),
            dependencies: self.graph.predecessors(node_id).to_vec(),
        });

        let supervisor = Supervisor {
            node,
            handler,
            store: Arc::clone(store),
            bootstrap: Arc::clone(bootstrap),
            scheduler: Arc::clone(scheduler),
            events: self.events.clone(),
            settings: self.settings.clone(),
            cancel: self.cancel.clone(),
            grace: self.grace,
        };
        let handle = join_set.spawn(supervisor.run());
        Ok(handle.id())
    }

    /// Fold one supervisor outcome into the scheduler and records
    fn settle(
        &self,
        outcome: NodeOutcome,
        scheduler: &Arc<Mutex<Scheduler>>,
        records: &mut FxHashMap<Arc<str>, NodeOutcome>,
    ) {
        let scheduled = match &outcome.error {
            None => Outcome::Succeeded,
            Some(err) if err.is_cancellation() => Outcome::Cancelled,
            Some(_) => Outcome::Failed,
        };
        if scheduled == Outcome::Cancelled {
            self.events.emit(EventKind::NodeSkipped {
                node_id: Arc::clone(&outcome.node_id),
                failed_ancestors: Vec::new(),
            });
        }
        let transition = scheduler.lock().complete(&outcome.node_id, scheduled);
        records.insert(Arc::clone(&outcome.node_id), outcome);
        self.emit_skips(&transition.skipped);
    }

    fn emit_skips(&self, skips: &[Skip]) {
        for skip in skips {
            self.events.emit(EventKind::NodeSkipped {
                node_id: Arc::clone(&skip.node_id),
                failed_ancestors: skip.failed_ancestors.clone(),
            });
        }
    }

    fn assemble_report(
        &self,
        run_start: Instant,
        cancelled: bool,
        scheduler: &Scheduler,
        store: &StateStore,
        records: &FxHashMap<Arc<str>, NodeOutcome>,
    ) -> RunReport {
        let mut nodes = Vec::with_capacity(self.graph.nodes().len());
        let mut outputs: BTreeMap<Arc<str>, BTreeMap<Arc<str>, Value>> = BTreeMap::new();
        let mut any_failed = false;

        for node in self.graph.nodes() {
            let status = scheduler
                .status(&node.id)
                .unwrap_or(NodeStatus::Pending);
            if status == NodeStatus::Failed {
                any_failed = true;
            }
            if status == NodeStatus::Succeeded {
                let ports: BTreeMap<Arc<str>, Value> = store
                    .outputs_of(&node.id)
                    .into_iter()
                    .collect();
                outputs.insert(Arc::clone(&node.id), ports);
            }
            let record = records.get(&node.id);
            nodes.push(NodeReport {
                node_id: Arc::clone(&node.id),
                status,
                attempts: record.map(|o| o.attempts).unwrap_or(0),
                error: record.and_then(|o| o.error.as_ref()).map(|e| e.to_string()),
                failed_ancestors: scheduler.recorded_failed_ancestors(&node.id).to_vec(),
                started_at_ms: record.map(|o| o.started_at_ms),
                finished_at_ms: record.map(|o| o.finished_at_ms),
                duration_ms: record.map(|o| o.duration_ms()).unwrap_or(0),
            });
        }

        RunReport {
            run_id: Arc::clone(&self.run_id),
            status: if any_failed {
                RunStatus::Failed
            } else {
                RunStatus::Completed
            },
            cancelled,
            duration_ms: run_start.elapsed().as_millis() as u64,
            nodes,
            outputs,
        }
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("run_id", &self.run_id)
            .field("nodes", &self.graph.nodes().len())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{validate, Graph};
    use crate::handler::{FnHandler, Handler, HandlerError, Invocation, Outputs};
    use serde_json::json;

    fn echo_registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        let echo: Arc<dyn Handler> = Arc::new(FnHandler::new(|inv: Invocation| async move {
            let mut out = Outputs::default();
            out.insert("out".into(), json!(inv.inputs.len()));
            Ok(out)
        }));
        registry.register("echo", echo);
        registry
    }

    fn validated(yaml: &str) -> ValidatedGraph {
        validate(&Graph::from_yaml(yaml).unwrap()).unwrap()
    }

    const CHAIN: &str = r#"
nodes:
  - id: a
    kind: echo
    outputs: [out]
  - id: b
    kind: echo
    inputs:
      x: { from: a.out }
    outputs: [out]
"#;

    #[tokio::test]
    async fn run_executes_exactly_once() {
        let run = Run::new(validated(CHAIN), echo_registry());
        let report = run.run().await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);

        let err = run.run().await.unwrap_err();
        assert!(matches!(err, RunError::AlreadyStarted));
    }

    #[tokio::test]
    async fn unknown_kind_fails_before_execution() {
        let graph = validated(
            r#"
nodes:
  - id: a
    kind: mystery
"#,
        );
        let run = Run::new(graph, echo_registry());
        let err = run.run().await.unwrap_err();
        assert!(matches!(
            err,
            RunError::Config(ConfigError::UnknownHandler { .. })
        ));
        assert!(run.events().is_empty());
    }

    #[tokio::test]
    async fn report_is_queryable_and_serializable() {
        let run = Run::new(validated(CHAIN), echo_registry());
        let report = run.run().await.unwrap();

        let a = report.node("a").unwrap();
        assert_eq!(a.status, NodeStatus::Succeeded);
        assert_eq!(a.attempts, 1);

        let json = report.to_json();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["cancelled"], false);
        assert_eq!(json["outputs"]["a"]["out"], json!(0));
        assert_eq!(json["outputs"]["b"]["out"], json!(1));
    }

    #[tokio::test]
    async fn event_offsets_measure_from_run_start() {
        let run = Run::new(validated(CHAIN), echo_registry());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let report = run.run().await.unwrap();

        // a run started late does not inherit the construction delay
        let first = run.events().events()[0].timestamp_ms;
        assert!(first < 50);
        assert!(report.node("a").unwrap().started_at_ms.unwrap() < 50);
    }

    #[tokio::test]
    async fn failed_node_fails_run_without_aborting() {
        let mut registry = echo_registry();
        let doomed: Arc<dyn Handler> = Arc::new(FnHandler::new(|_inv| async move {
            Err(HandlerError::fatal("no luck"))
        }));
        registry.register("doomed", doomed);

        let graph = validated(
            r#"
nodes:
  - id: a
    kind: doomed
    outputs: [out]
  - id: b
    kind: echo
    inputs:
      x: { from: a.out }
  - id: lone
    kind: echo
    outputs: [out]
"#,
        );
        let run = Run::new(graph, registry);
        let report = run.run().await.unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.node("a").unwrap().status, NodeStatus::Failed);
        let b = report.node("b").unwrap();
        assert_eq!(b.status, NodeStatus::Skipped);
        assert_eq!(b.failed_ancestors, vec![Arc::<str>::from("a")]);
        // the independent branch still ran
        assert_eq!(report.node("lone").unwrap().status, NodeStatus::Succeeded);
    }
}
