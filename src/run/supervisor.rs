//! Per-node execution supervisor
//!
//! Owns one node from dispatch to terminal outcome: resolves inputs,
//! invokes the handler under a per-attempt timeout, classifies failures,
//! applies retry backoff with jitter, and publishes outputs. Cancellation
//! gives the in-flight handler a grace period to return; a handler that
//! ignores it past the grace is a non-retryable failure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::NodeError;
use crate::event::{EventKind, EventLog};
use crate::graph::Node;
use crate::handler::{Handler, Invocation, Outputs};
use crate::run::scheduler::Scheduler;
use crate::settings::RunSettings;
use crate::store::StateStore;

/// How long a cancelled handler gets to return before it is declared
/// unresponsive
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Externally supplied input values: node id -> input port -> value.
/// Overlaid on input resolution at dispatch time, never written to the
/// store.
pub type Bootstrap = FxHashMap<Arc<str>, FxHashMap<Arc<str>, Value>>;

/// Terminal result of supervising one node
#[derive(Debug)]
pub struct NodeOutcome {
    pub node_id: Arc<str>,
    /// Attempts actually made (>= 1 unless cancelled before dispatch)
    pub attempts: u32,
    /// `None` on success
    pub error: Option<NodeError>,
    /// Offsets from run start (ms)
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
}

impl NodeOutcome {
    pub fn duration_ms(&self) -> u64 {
        self.finished_at_ms.saturating_sub(self.started_at_ms)
    }
}

pub(crate) struct Supervisor {
    pub node: Arc<Node>,
    pub handler: Arc<dyn Handler>,
    pub store: Arc<StateStore>,
    pub bootstrap: Arc<Bootstrap>,
    pub scheduler: Arc<Mutex<Scheduler>>,
    pub events: EventLog,
    pub settings: RunSettings,
    pub cancel: CancellationToken,
    pub grace: Duration,
}

impl Supervisor {
    /// Drive the node to a terminal outcome
    #[instrument(skip_all, fields(node = %self.node.id))]
    pub async fn run(self) -> NodeOutcome {
        let started = Instant::now();
        let started_at_ms = self.events.elapsed_ms();
        let max_retries = self
            .node
            .retries
            .unwrap_or(self.settings.retry.max_retries);
        let timeout = self.node.timeout.unwrap_or(self.settings.default_timeout);

        let inputs = match self.resolve_inputs() {
            Ok(inputs) => inputs,
            Err(err) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.events.emit(EventKind::NodeFailed {
                    node_id: Arc::clone(&self.node.id),
                    attempt: 0,
                    error: err.to_string(),
                    duration_ms,
                });
                return NodeOutcome {
                    node_id: Arc::clone(&self.node.id),
                    attempts: 0,
                    error: Some(err),
                    started_at_ms,
                    finished_at_ms: started_at_ms + duration_ms,
                };
            }
        };

        let mut attempt = 0u32;
        let error = loop {
            self.events.emit(EventKind::NodeStarted {
                node_id: Arc::clone(&self.node.id),
                attempt,
            });
            debug!(attempt, "dispatching handler");

            match self.attempt(inputs.clone(), timeout).await {
                Ok(outputs) => match self.publish(outputs) {
                    Ok(()) => {
                        let duration_ms = started.elapsed().as_millis() as u64;
                        self.events.emit(EventKind::NodeSucceeded {
                            node_id: Arc::clone(&self.node.id),
                            attempt,
                            duration_ms,
                        });
                        return NodeOutcome {
                            node_id: Arc::clone(&self.node.id),
                            attempts: attempt + 1,
                            error: None,
                            started_at_ms,
                            finished_at_ms: started_at_ms + duration_ms,
                        };
                    }
                    // publish failures are handler defects, never retried
                    Err(err) => break err,
                },
                Err(err) if err.is_retryable() && attempt < max_retries => {
                    let delay = self.backoff_with_jitter(attempt);
                    warn!(attempt, error = %err, ?delay, "retrying after backoff");
                    self.events.emit(EventKind::NodeRetrying {
                        node_id: Arc::clone(&self.node.id),
                        attempt,
                        error: err.to_string(),
                        delay_ms: delay.as_millis() as u64,
                    });
                    self.scheduler.lock().mark_retrying(&self.node.id);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => break NodeError::Cancelled,
                    }
                    self.scheduler.lock().mark_running(&self.node.id);
                    attempt += 1;
                }
                Err(err) => break err,
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        if !error.is_cancellation() {
            self.events.emit(EventKind::NodeFailed {
                node_id: Arc::clone(&self.node.id),
                attempt,
                error: error.to_string(),
                duration_ms,
            });
        }
        NodeOutcome {
            node_id: Arc::clone(&self.node.id),
            attempts: attempt + 1,
            error: Some(error),
            started_at_ms,
            finished_at_ms: started_at_ms + duration_ms,
        }
    }

    /// One handler invocation under the per-attempt timeout, with the
    /// cancellation grace window
    async fn attempt(
        &self,
        inputs: FxHashMap<Arc<str>, Value>,
        timeout: Duration,
    ) -> Result<Outputs, NodeError> {
        let invocation = Invocation {
            node_id: Arc::clone(&self.node.id),
            inputs,
            meta: self.node.meta.clone(),
            cancel: self.cancel.child_token(),
        };
        let fut = self.handler.execute(invocation);
        tokio::pin!(fut);

        // biased: a pending cancellation always wins over a completed
        // attempt, keeping the outcome deterministic
        let raced = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = tokio::time::timeout(timeout, &mut fut) => Some(result),
        };

        match raced {
            Some(Ok(Ok(outputs))) => Ok(outputs),
            Some(Ok(Err(err))) => Err(NodeError::Handler {
                message: err.message,
                retryable: err.retryable,
            }),
            Some(Err(_)) => Err(NodeError::Timeout { timeout }),
            // Grace window: a prompt return is a cancellation outcome
            // either way; an overrun is a hard failure.
            None => match tokio::time::timeout(self.grace, &mut fut).await {
                Ok(_) => Err(NodeError::Cancelled),
                Err(_) => Err(NodeError::Unresponsive { grace: self.grace }),
            },
        }
    }

    /// Resolve every input port: bootstrap overlay wins, then bindings
    /// against the store
    fn resolve_inputs(&self) -> Result<FxHashMap<Arc<str>, Value>, NodeError> {
        let overlay = self.bootstrap.get(&self.node.id);
        let mut inputs = FxHashMap::default();

        for (port, binding) in &self.node.inputs {
            let value = match overlay.and_then(|ports| ports.get(port)) {
                Some(value) => value.clone(),
                None => {
                    self.store
                        .read(binding)
                        .ok_or_else(|| NodeError::MissingInput {
                            port: Arc::clone(port),
                        })?
                }
            };
            inputs.insert(Arc::clone(port), value);
        }
        // Bootstrap may feed ports the graph leaves unbound
        if let Some(ports) = overlay {
            for (port, value) in ports {
                inputs
                    .entry(Arc::clone(port))
                    .or_insert_with(|| value.clone());
            }
        }
        Ok(inputs)
    }

    /// Write declared outputs; missing or undeclared ports fail the node
    fn publish(&self, mut outputs: Outputs) -> Result<(), NodeError> {
        for port in &self.node.outputs {
            let value = outputs
                .remove(&port.name)
                .ok_or_else(|| NodeError::MissingOutput {
                    port: Arc::clone(&port.name),
                })?;
            self.store.write(&self.node.id, &port.name, value)?;
        }
        // Anything left over was not declared
        if let Some(port) = outputs.keys().next() {
            return Err(NodeError::Store(
                crate::error::StoreViolation::UndeclaredPort {
                    node_id: Arc::clone(&self.node.id),
                    port: Arc::clone(port),
                },
            ));
        }
        Ok(())
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.settings.retry.backoff(attempt);
        if base.is_zero() {
            return base;
        }
        // Uniform jitter up to half the backoff, spreading thundering herds
        let jitter_cap = (base / 2).as_millis() as u64;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        base + Duration::from_millis(jitter)
    }
}
