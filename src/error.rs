//! Weir error types with error codes
//!
//! Error code ranges:
//! - WEIR-000-009: Graph parse/settings errors
//! - WEIR-010-019: Graph validation errors
//! - WEIR-020-029: Run/API misuse errors
//!
//! Node-level failures are not error codes: they are classified outcomes
//! ([`NodeError`]) recorded in the run report, never raised to the caller.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// Fatal graph-shape errors, raised before any node runs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("[WEIR-001] Failed to parse graph definition: {details}")]
    Parse { details: String },

    #[error("[WEIR-002] Invalid run settings: {reason}")]
    InvalidSettings { reason: String },

    #[error("[WEIR-010] Duplicate node id '{node_id}'")]
    DuplicateNodeId { node_id: Arc<str> },

    #[error("[WEIR-011] Input '{input}' of node '{node_id}' references unknown node '{referenced}'")]
    UnknownBindingNode {
        node_id: Arc<str>,
        input: Arc<str>,
        referenced: Arc<str>,
    },

    #[error("[WEIR-012] Input '{input}' of node '{node_id}' references port '{referenced}.{port}', which '{referenced}' does not declare as an output")]
    UnknownBindingPort {
        node_id: Arc<str>,
        input: Arc<str>,
        referenced: Arc<str>,
        port: Arc<str>,
    },

    #[error("[WEIR-013] Input '{input}' of node '{node_id}' references the node itself")]
    SelfReference { node_id: Arc<str>, input: Arc<str> },

    #[error("[WEIR-014] Node '{node_id}' has unknown handler kind '{kind}'")]
    UnknownHandler { node_id: Arc<str>, kind: Arc<str> },

    #[error("[WEIR-015] Cycle detected in dependency graph: {}", format_cycle(.nodes))]
    Cycle { nodes: Vec<Arc<str>> },

    #[error("[WEIR-016] Edge references unknown node '{node_id}'")]
    UnknownEdgeNode { node_id: Arc<str> },

    #[error("[WEIR-017] Duplicate output port '{port}' declared on node '{node_id}'")]
    DuplicateOutputPort { node_id: Arc<str>, port: Arc<str> },
}

fn format_cycle(nodes: &[Arc<str>]) -> String {
    let mut path: Vec<&str> = nodes.iter().map(|n| n.as_ref()).collect();
    if let Some(first) = path.first().copied() {
        path.push(first);
    }
    path.join(" -> ")
}

impl FixSuggestion for ConfigError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            ConfigError::Parse { .. } => Some("Check YAML syntax: indentation and quoting"),
            ConfigError::InvalidSettings { .. } => {
                Some("concurrency must be positive; durations use forms like 30s, 5m, 250ms")
            }
            ConfigError::DuplicateNodeId { .. } => Some("Use unique ids for every node"),
            ConfigError::UnknownBindingNode { .. } => {
                Some("Verify the referenced node id exists in the graph")
            }
            ConfigError::UnknownBindingPort { .. } => {
                Some("Add the port to the referenced node's outputs, or fix the reference")
            }
            ConfigError::SelfReference { .. } => {
                Some("A node cannot consume its own output; bind from an upstream node")
            }
            ConfigError::UnknownHandler { .. } => {
                Some("Register a handler for this kind before starting the run")
            }
            ConfigError::Cycle { .. } => {
                Some("Remove one of the listed dependencies to break the cycle")
            }
            ConfigError::UnknownEdgeNode { .. } => {
                Some("Edges must name node ids declared in the graph")
            }
            ConfigError::DuplicateOutputPort { .. } => Some("Declare each output port once"),
        }
    }
}

/// Violation of the state store's write discipline.
///
/// Always a non-retryable defect in the handler that produced the write.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreViolation {
    #[error("port '{node_id}.{port}' was already written")]
    DuplicateWrite { node_id: Arc<str>, port: Arc<str> },

    #[error("port '{port}' is not a declared output of node '{node_id}'")]
    UndeclaredPort { node_id: Arc<str>, port: Arc<str> },

    #[error("node '{node_id}' is not part of this run")]
    UnknownNode { node_id: Arc<str> },
}

/// Classified outcome of a failed node attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    /// Handler did not complete within the per-attempt budget. Retryable.
    #[error("handler did not complete within {timeout:?}")]
    Timeout { timeout: Duration },

    /// Handler reported failure; the handler sets the retryable flag.
    #[error("handler error: {message}")]
    Handler { message: String, retryable: bool },

    /// The run was cancelled while this node was in flight.
    #[error("cancelled")]
    Cancelled,

    /// Handler ignored cancellation past the grace period.
    #[error("handler did not observe cancellation within {grace:?}")]
    Unresponsive { grace: Duration },

    /// Write-once or declared-port violation while publishing outputs.
    #[error("store violation: {0}")]
    Store(#[from] StoreViolation),

    /// Handler succeeded but omitted a declared output port.
    #[error("handler did not produce declared output port '{port}'")]
    MissingOutput { port: Arc<str> },

    /// Input port has neither a binding nor a bootstrap value.
    #[error("input port '{port}' has no binding and no bootstrap value")]
    MissingInput { port: Arc<str> },
}

impl NodeError {
    /// Whether the supervisor may re-dispatch the attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            NodeError::Timeout { .. } => true,
            NodeError::Handler { retryable, .. } => *retryable,
            NodeError::Cancelled
            | NodeError::Unresponsive { .. }
            | NodeError::Store(_)
            | NodeError::MissingOutput { .. }
            | NodeError::MissingInput { .. } => false,
        }
    }

    /// Whether this outcome came from cancellation rather than real failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, NodeError::Cancelled)
    }
}

/// Errors raised synchronously by the run API.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("[WEIR-020] Run was already started; a Run executes exactly once")]
    AlreadyStarted,
}
