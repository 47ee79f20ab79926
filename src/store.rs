//! Run-scoped state store: write-once port values
//!
//! Keyed by `(node id, port)`. Only the node that declares a port may write
//! it, and only once; the scheduler guarantees a reference is never read
//! before its producer succeeded, so `read` treats a missing reference as a
//! scheduling defect rather than a recoverable condition.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::error::StoreViolation;
use crate::graph::{Binding, ValidatedGraph};

/// Port values produced so far in one run
#[derive(Debug)]
pub struct StateStore {
    values: DashMap<(Arc<str>, Arc<str>), Value>,
    /// node id -> declared output ports, frozen at construction
    declared: FxHashMap<Arc<str>, FxHashSet<Arc<str>>>,
}

impl StateStore {
    pub fn new(graph: &ValidatedGraph) -> Self {
        let declared = graph
            .nodes()
            .iter()
            .map(|node| {
                let ports: FxHashSet<Arc<str>> =
                    node.outputs.iter().map(|p| Arc::clone(&p.name)).collect();
                (Arc::clone(&node.id), ports)
            })
            .collect();
        Self {
            values: DashMap::new(),
            declared,
        }
    }

    /// Publish one output port value. Write-once: a second write to the
    /// same `(node, port)` is a violation, as is an undeclared port.
    pub fn write(
        &self,
        node_id: &Arc<str>,
        port: &Arc<str>,
        value: Value,
    ) -> Result<(), StoreViolation> {
        let Some(ports) = self.declared.get(node_id) else {
            return Err(StoreViolation::UnknownNode {
                node_id: Arc::clone(node_id),
            });
        };
        if !ports.contains(port) {
            return Err(StoreViolation::UndeclaredPort {
                node_id: Arc::clone(node_id),
                port: Arc::clone(port),
            });
        }
        let key = (Arc::clone(node_id), Arc::clone(port));
        match self.values.entry(key) {
            Entry::Occupied(_) => Err(StoreViolation::DuplicateWrite {
                node_id: Arc::clone(node_id),
                port: Arc::clone(port),
            }),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    /// Resolve one binding: literals immediately, references by lookup.
    /// Returns `None` only if the referenced value was never produced,
    /// which scheduling causality rules out for dispatched nodes.
    pub fn read(&self, binding: &Binding) -> Option<Value> {
        match binding {
            Binding::Literal { value } => Some(value.clone()),
            Binding::Ref { from } => self
                .values
                .get(&(Arc::clone(&from.node), Arc::clone(&from.port)))
                .map(|v| v.clone()),
        }
    }

    pub fn get(&self, node_id: &Arc<str>, port: &Arc<str>) -> Option<Value> {
        self.values
            .get(&(Arc::clone(node_id), Arc::clone(port)))
            .map(|v| v.clone())
    }

    /// Snapshot of every port a node has produced, for the run report
    pub fn outputs_of(&self, node_id: &str) -> FxHashMap<Arc<str>, Value> {
        self.values
            .iter()
            .filter(|entry| entry.key().0.as_ref() == node_id)
            .map(|entry| (Arc::clone(&entry.key().1), entry.value().clone()))
            .collect()
    }
}
