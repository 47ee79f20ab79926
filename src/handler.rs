//! Pluggable task handlers and the kind -> handler registry
//!
//! Handlers are the only extension point of the engine: one async call per
//! node attempt, resolved inputs in, named output ports out. The engine
//! invokes handlers at-least-once (retries re-invoke), so side effects
//! should be idempotent or tolerated.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;
use crate::graph::ValidatedGraph;

/// Output port name -> produced value
pub type Outputs = FxHashMap<Arc<str>, Value>;

/// Failure reported by a handler. The handler classifies retryability:
/// transient conditions (connection reset, rate limit) set it, permanent
/// ones (malformed payload) clear it.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    /// Transient failure: the supervisor may retry the attempt
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Permanent failure: retrying cannot help
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// One node attempt's worth of context, handed to the handler
#[derive(Debug, Clone)]
pub struct Invocation {
    pub node_id: Arc<str>,
    /// Input port -> resolved value (literals, upstream outputs, bootstrap)
    pub inputs: FxHashMap<Arc<str>, Value>,
    /// The node's opaque `meta` bag, untouched by the engine
    pub meta: serde_json::Map<String, Value>,
    /// Cancelled when the run is cancelled; long handlers must observe it
    pub cancel: CancellationToken,
}

/// A unit of executable work, selected by node `kind`
#[async_trait]
pub trait Handler: Send + Sync {
    async fn execute(&self, invocation: Invocation) -> Result<Outputs, HandlerError>;
}

/// Adapts an async closure into a [`Handler`]
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outputs, HandlerError>> + Send,
{
    async fn execute(&self, invocation: Invocation) -> Result<Outputs, HandlerError> {
        (self.f)(invocation).await
    }
}

/// Kind -> handler table, frozen before the run starts
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: FxHashMap<Arc<str>, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `kind`, replacing any previous one
    pub fn register(&mut self, kind: impl Into<Arc<str>>, handler: Arc<dyn Handler>) {
        self.handlers.insert(kind.into(), handler);
    }

    pub fn resolve(&self, kind: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(kind).map(Arc::clone)
    }

    /// Check every node's kind resolves, before anything executes
    pub fn resolve_all(&self, graph: &ValidatedGraph) -> Result<(), ConfigError> {
        for node in graph.nodes() {
            if !self.handlers.contains_key(&node.kind) {
                return Err(ConfigError::UnknownHandler {
                    node_id: Arc::clone(&node.id),
                    kind: Arc::clone(&node.kind),
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.handlers.keys().map(|k| k.as_ref()).collect();
        kinds.sort();
        f.debug_struct("HandlerRegistry").field("kinds", &kinds).finish()
    }
}
