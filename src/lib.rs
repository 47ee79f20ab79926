//! Weir - concurrency-bounded DAG workflow execution engine
//!
//! Takes a validated directed acyclic task graph plus a registry of
//! pluggable handlers and drives the graph to completion: dependency
//! resolution, bounded concurrency, per-attempt timeouts, retry with
//! exponential backoff, transitive failure propagation, and a structured
//! event stream plus final run report.
//!
//! ```no_run
//! use std::sync::Arc;
//! use weir::{validate, FnHandler, Graph, Handler, HandlerRegistry, Outputs, Run};
//!
//! # async fn demo() -> Result<(), weir::RunError> {
//! let graph = Graph::from_yaml(
//!     r#"
//! nodes:
//!   - id: greet
//!     kind: echo
//!     inputs:
//!       name: { value: "world" }
//!     outputs: [message]
//! "#,
//! )?;
//! let validated = validate(&graph)?;
//!
//! let mut registry = HandlerRegistry::new();
//! let echo: Arc<dyn Handler> = Arc::new(FnHandler::new(|inv: weir::Invocation| async move {
//!     let mut out = Outputs::default();
//!     out.insert("message".into(), inv.inputs[&Arc::<str>::from("name")].clone());
//!     Ok(out)
//! }));
//! registry.register("echo", echo);
//!
//! let report = Run::new(validated, registry).run().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod event;
pub mod graph;
pub mod handler;
pub mod run;
pub mod settings;
pub mod store;

pub use error::{ConfigError, FixSuggestion, NodeError, RunError, StoreViolation};
pub use event::{Event, EventKind, EventLog};
pub use graph::{validate, Binding, Edge, Graph, Node, PortDecl, PortRef, ValidatedGraph};
pub use handler::{FnHandler, Handler, HandlerError, HandlerRegistry, Invocation, Outputs};
pub use run::{NodeReport, NodeStatus, Run, RunReport, RunStatus};
pub use settings::{parse_duration, RetryPolicy, RunSettings};
pub use store::StateStore;
