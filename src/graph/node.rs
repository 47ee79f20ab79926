//! Graph definition structures: nodes, bindings, edges
//!
//! A `Graph` is the declarative workflow description handed to the engine
//! by the planning stage. Parsing is deliberately permissive about shape
//! sugar (string ports, `node.port` references); `validate` is the gate
//! that enforces structural invariants.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::ConfigError;
use crate::settings::{de_opt_duration, RunSettings};

/// Reference to another node's output port, written `node.port`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub node: Arc<str>,
    pub port: Arc<str>,
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.port)
    }
}

impl<'de> Deserialize<'de> for PortRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.split_once('.') {
            Some((node, port)) if !node.is_empty() && !port.is_empty() => Ok(PortRef {
                node: node.into(),
                port: port.into(),
            }),
            _ => Err(serde::de::Error::custom(format!(
                "expected 'node.port' reference, got '{raw}'"
            ))),
        }
    }
}

/// Source of one input port: a literal value or an upstream reference
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Binding {
    /// `{ from: "upstream.port" }`
    Ref { from: PortRef },
    /// `{ value: <any json> }`
    Literal { value: Value },
}

impl Binding {
    /// The upstream node this binding depends on, if any
    pub fn source(&self) -> Option<&PortRef> {
        match self {
            Binding::Ref { from } => Some(from),
            Binding::Literal { .. } => None,
        }
    }
}

/// Declared output port; `ty` is validation-time documentation only
#[derive(Debug, Clone, PartialEq)]
pub struct PortDecl {
    pub name: Arc<str>,
    pub ty: Option<String>,
}

impl<'de> Deserialize<'de> for PortDecl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Accepts bare "name" or { name, ty }
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Name(String),
            Full { name: String, ty: Option<String> },
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Name(name) => PortDecl {
                name: name.into(),
                ty: None,
            },
            Raw::Full { name, ty } => PortDecl {
                name: name.into(),
                ty,
            },
        })
    }
}

/// One unit of work: a handler kind plus typed input/output ports
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Node {
    /// Unique id within the graph
    pub id: Arc<str>,

    /// Handler selector, resolved against the registry before the run
    pub kind: Arc<str>,

    /// Input port -> binding (BTreeMap keeps resolution order deterministic)
    #[serde(default)]
    pub inputs: BTreeMap<Arc<str>, Binding>,

    /// Declared output ports; every one must be produced on success
    #[serde(default)]
    pub outputs: Vec<PortDecl>,

    /// Retries after the first attempt; falls back to the run retry policy
    #[serde(default)]
    pub retries: Option<u32>,

    /// Per-attempt timeout; falls back to the run default
    #[serde(default, deserialize_with = "de_opt_duration")]
    pub timeout: Option<Duration>,

    /// Opaque bag passed through to the handler and trace output
    #[serde(default)]
    pub meta: serde_json::Map<String, Value>,
}

impl Node {
    pub fn declares_output(&self, port: &str) -> bool {
        self.outputs.iter().any(|p| p.name.as_ref() == port)
    }

    /// Upstream node ids referenced by this node's bindings (with duplicates)
    pub fn referenced_nodes(&self) -> impl Iterator<Item = &Arc<str>> {
        self.inputs
            .values()
            .filter_map(|b| b.source())
            .map(|r| &r.node)
    }
}

/// Explicit dependency declaration, merged with binding-derived edges
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Edge {
    pub from: Arc<str>,
    pub to: Arc<str>,
}

/// Declarative workflow: nodes, explicit edges, and run settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Graph {
    #[serde(default)]
    pub settings: RunSettings,

    pub nodes: Vec<Arc<Node>>,

    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    /// Parse a YAML graph definition
    pub fn from_yaml(source: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(source).map_err(|e| ConfigError::Parse {
            details: e.to_string(),
        })
    }

    /// Parse a JSON graph definition
    pub fn from_json(source: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(source).map_err(|e| ConfigError::Parse {
            details: e.to_string(),
        })
    }

    pub fn node(&self, id: &str) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|n| n.id.as_ref() == id)
    }
}
