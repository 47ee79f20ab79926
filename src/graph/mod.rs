//! Workflow graph: declarative definition plus the validation gate

pub mod node;
pub mod validate;

pub use node::{Binding, Edge, Graph, Node, PortDecl, PortRef};
pub use validate::{validate, ValidatedGraph};
