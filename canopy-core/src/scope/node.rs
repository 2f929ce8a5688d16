//! Scope Nodes
//!
//! This module defines the arena slots that make up a scope tree.
//!
//! Nodes never point at each other directly. A node names its parent and
//! children by `ScopeId`, and the tree's table owns every node. Removing a
//! node from the table is what destroys it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;

use super::events::EventListener;
use super::watch::Watch;
use crate::value::Value;

/// Unique identifier for a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    /// Generate a new unique scope ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// A scope's slot in the tree table.
pub(crate) struct Node {
    /// Parent scope. `None` only for the root.
    pub(crate) parent: Option<ScopeId>,

    /// Live children in creation order.
    pub(crate) children: Vec<ScopeId>,

    /// Isolated scopes do not inherit properties from their parent.
    pub(crate) isolate: bool,

    /// Set once `destroy` has started on this node.
    pub(crate) destroying: bool,

    /// Own properties.
    pub(crate) properties: IndexMap<String, Value>,

    /// Watches in registration order.
    pub(crate) watches: Vec<Arc<Watch>>,

    /// Event listeners keyed by event name, each list in registration order.
    pub(crate) listeners: IndexMap<String, Vec<Arc<EventListener>>>,
}

impl Node {
    /// Create the root node.
    pub(crate) fn root() -> Self {
        Self::new(None, false)
    }

    /// Create a node attached under `parent`.
    pub(crate) fn child(parent: ScopeId, isolate: bool) -> Self {
        Self::new(Some(parent), isolate)
    }

    fn new(parent: Option<ScopeId>, isolate: bool) -> Self {
        Self {
            parent,
            children: Vec::new(),
            isolate,
            destroying: false,
            properties: IndexMap::new(),
            watches: Vec::new(),
            listeners: IndexMap::new(),
        }
    }

    pub(crate) fn add_child(&mut self, child: ScopeId) {
        self.children.push(child);
    }

    pub(crate) fn remove_child(&mut self, child: ScopeId) {
        self.children.retain(|c| *c != child);
    }

    /// Mark every watch and listener on this node inactive.
    ///
    /// Digest rounds and event dispatch work from snapshots, so deactivation
    /// is what stops a snapshot entry from firing after its node is gone.
    pub(crate) fn deactivate(&self) {
        for watch in &self.watches {
            watch.deactivate();
        }
        for listener in self.listeners.values().flatten() {
            listener.deactivate();
        }
    }

    pub(crate) fn listener_count(&self, name: &str) -> usize {
        self.listeners.get(name).map_or(0, Vec::len)
    }
}
