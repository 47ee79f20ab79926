//! Event sourcing for run execution
//!
//! Every state transition of a run emits exactly one event into an
//! append-only log. Consumers either read the log after the fact
//! (audit, report rendering) or subscribe to the live broadcast feed
//! (CLI progress).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Buffered events per live subscriber before lagging drops old ones
const BROADCAST_CAPACITY: usize = 256;

/// Single event in the run execution log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence id, total order within one run
    pub id: u64,
    pub run_id: Arc<str>,
    /// Time since run start (ms)
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

/// All event types, run level and node level
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted {
        node_count: usize,
    },
    RunFinished {
        completed: bool,
        cancelled: bool,
        duration_ms: u64,
    },

    /// Node became ready: every predecessor succeeded
    NodeScheduled {
        node_id: Arc<str>,
        dependencies: Vec<Arc<str>>,
    },
    /// Attempt dispatched to its handler (attempt is 0-based)
    NodeStarted {
        node_id: Arc<str>,
        attempt: u32,
    },
    NodeSucceeded {
        node_id: Arc<str>,
        attempt: u32,
        duration_ms: u64,
    },
    NodeFailed {
        node_id: Arc<str>,
        attempt: u32,
        error: String,
        duration_ms: u64,
    },
    /// Retryable failure with budget left; next attempt follows the delay
    NodeRetrying {
        node_id: Arc<str>,
        attempt: u32,
        error: String,
        delay_ms: u64,
    },
    NodeSkipped {
        node_id: Arc<str>,
        /// Failed or skipped ancestors that caused the skip
        failed_ancestors: Vec<Arc<str>>,
    },
}

impl EventKind {
    /// Extract node_id if event is node-related
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeScheduled { node_id, .. }
            | Self::NodeStarted { node_id, .. }
            | Self::NodeSucceeded { node_id, .. }
            | Self::NodeFailed { node_id, .. }
            | Self::NodeRetrying { node_id, .. }
            | Self::NodeSkipped { node_id, .. } => Some(node_id),
            Self::RunStarted { .. } | Self::RunFinished { .. } => None,
        }
    }

    pub fn is_run_event(&self) -> bool {
        matches!(self, Self::RunStarted { .. } | Self::RunFinished { .. })
    }
}

/// Thread-safe, append-only event log with a live broadcast feed
#[derive(Clone)]
pub struct EventLog {
    run_id: Arc<str>,
    events: Arc<RwLock<Vec<Event>>>,
    start_time: Arc<RwLock<Instant>>,
    next_id: Arc<AtomicU64>,
    feed: broadcast::Sender<Event>,
}

impl EventLog {
    pub fn new(run_id: Arc<str>) -> Self {
        let (feed, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            run_id,
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Arc::new(RwLock::new(Instant::now())),
            next_id: Arc::new(AtomicU64::new(0)),
            feed,
        }
    }

    pub fn run_id(&self) -> &Arc<str> {
        &self.run_id
    }

    /// Re-anchor the timestamp epoch. The run controller calls this when
    /// execution begins, so offsets measure from run start rather than
    /// from construction.
    pub fn mark_start(&self) {
        *self.start_time.write() = Instant::now();
    }

    /// Elapsed run time in milliseconds
    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.read().elapsed().as_millis() as u64
    }

    /// Emit an event (thread-safe, returns event id)
    pub fn emit(&self, kind: EventKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            run_id: Arc::clone(&self.run_id),
            timestamp_ms: self.elapsed_ms(),
            kind,
        };

        self.events.write().push(event.clone());
        let _ = self.feed.send(event); // no live subscribers is fine
        id
    }

    /// Subscribe to events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.feed.subscribe()
    }

    /// Get all events (cloned)
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Filter events by node id
    pub fn filter_node(&self, node_id: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.node_id() == Some(node_id))
            .collect()
    }

    /// Run-level events only
    pub fn run_events(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.is_run_event())
            .collect()
    }

    /// Serialize to JSON for persistence/debugging
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.events()).unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("run_id", &self.run_id)
            .field("len", &self.len())
            .finish()
    }
}
