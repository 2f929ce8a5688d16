//! Scope Tree
//!
//! A scope tree is an arena: one table maps `ScopeId`s to nodes, and a
//! `Scope` is a cheap handle made of the shared tree plus an ID. Parent and
//! child links are IDs into the table, so there are no reference cycles
//! between nodes and a destroyed node is simply absent.
//!
//! # Property lookup
//!
//! Reading a property checks the scope's own properties first, then walks
//! up through its ancestors until the name is found or the walk reaches the
//! root. An isolated scope ends the walk at itself. Writing always sets an
//! own property, shadowing any inherited one.
//!
//! # Locking
//!
//! The table lives behind a `parking_lot::Mutex`. No lock is ever held while
//! user code runs, because listeners are free to call back into any scope
//! API, including structural changes like `new_child` and `destroy`.
//!
//! # Destroyed scopes
//!
//! Handles outlive their nodes. Operations on a destroyed scope are inert:
//! reads return `Undefined`, writes and registrations are dropped, and
//! `apply`/`digest` return `ScopeError::Destroyed`.
//!
//! Closures registered on a scope may capture `Scope` handles. Those keep
//! the tree alive until the owning scope is destroyed, so long-lived
//! applications should destroy scopes they no longer need.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::digest::Queues;
use super::error::{ScopeError, ScopeResult};
use super::events::DESTROY_EVENT;
use super::exception::{CallbackError, ExceptionHandler};
use super::listener::{ListenerId, WatchId};
use super::node::{Node, ScopeId};
use super::phase::{Phase, PhaseCell};
use super::scheduler::{default_scheduler, Scheduler};
use crate::config::ScopeConfig;
use crate::value::Value;

/// State shared by every scope in one tree.
pub(crate) struct Tree {
    pub(crate) root: ScopeId,
    nodes: Mutex<HashMap<ScopeId, Node>>,
    pub(crate) phase: PhaseCell,
    pub(crate) queues: Mutex<Queues>,
    pub(crate) config: ScopeConfig,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) exception_handler: ExceptionHandler,
}

impl Tree {
    pub(crate) fn with_node<R>(&self, id: ScopeId, f: impl FnOnce(&Node) -> R) -> Option<R> {
        self.nodes.lock().get(&id).map(f)
    }

    pub(crate) fn with_node_mut<R>(
        &self,
        id: ScopeId,
        f: impl FnOnce(&mut Node) -> R,
    ) -> Option<R> {
        self.nodes.lock().get_mut(&id).map(f)
    }

    pub(crate) fn contains(&self, id: ScopeId) -> bool {
        self.nodes.lock().contains_key(&id)
    }

    pub(crate) fn report(&self, error: &CallbackError, context: &str) {
        self.exception_handler.handle(error, context);
    }

    pub(crate) fn remove_watch(&self, scope: ScopeId, watch: WatchId) {
        let removed = self.with_node_mut(scope, |node| {
            let idx = node.watches.iter().position(|w| w.id() == watch)?;
            Some(node.watches.remove(idx))
        });
        if let Some(Some(watch)) = removed {
            watch.deactivate();
        }
    }

    pub(crate) fn remove_listener(&self, scope: ScopeId, name: &str, listener: ListenerId) {
        let removed = self.with_node_mut(scope, |node| {
            let list = node.listeners.get_mut(name)?;
            let idx = list.iter().position(|l| l.id() == listener)?;
            let removed = list.remove(idx);
            if list.is_empty() {
                node.listeners.shift_remove(name);
            }
            Some(removed)
        });
        if let Some(Some(listener)) = removed {
            listener.deactivate();
        }
    }

    /// Flag `id` and every descendant as destroying, under one lock.
    ///
    /// Returns the scopes flagged by this call, or `None` if `id` is gone or
    /// already destroying. Subtrees already being destroyed are left out.
    fn mark_destroying(&self, id: ScopeId) -> Option<HashSet<ScopeId>> {
        let mut nodes = self.nodes.lock();
        match nodes.get(&id) {
            Some(node) if !node.destroying => {}
            _ => return None,
        }

        let mut marked = HashSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = nodes.get_mut(&current) else {
                continue;
            };
            if node.destroying {
                continue;
            }
            node.destroying = true;
            marked.insert(current);
            stack.extend(node.children.iter().copied());
        }
        Some(marked)
    }

    /// Unlink `id` from its parent and remove it and its descendants in
    /// `marked` from the table.
    ///
    /// A descendant outside `marked` belongs to a destroy still in progress
    /// and is left for that call to remove.
    fn detach_subtree(&self, id: ScopeId, marked: &HashSet<ScopeId>) -> Vec<(ScopeId, Node)> {
        let mut nodes = self.nodes.lock();

        let parent = match nodes.get(&id) {
            Some(node) => node.parent,
            None => return Vec::new(),
        };
        if let Some(parent) = parent.and_then(|p| nodes.get_mut(&p)) {
            parent.remove_child(id);
        }

        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !marked.contains(&current) {
                continue;
            }
            if let Some(node) = nodes.remove(&current) {
                stack.extend(node.children.iter().rev().copied());
                removed.push((current, node));
            }
        }
        removed
    }
}

/// Handle to one scope in a tree.
///
/// Cloning a handle is cheap and yields the same scope.
#[derive(Clone)]
pub struct Scope {
    tree: Arc<Tree>,
    id: ScopeId,
}

/// Builder for a root scope.
pub struct ScopeBuilder {
    config: ScopeConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
    exception_handler: ExceptionHandler,
}

impl ScopeBuilder {
    /// Tree configuration, normalized on the way in.
    pub fn config(mut self, config: ScopeConfig) -> Self {
        self.config = config.normalized();
        self
    }

    /// Scheduler for deferred digests. Defaults to [`default_scheduler`].
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Sink for errors raised by callbacks anywhere in the tree.
    pub fn exception_handler(mut self, handler: ExceptionHandler) -> Self {
        self.exception_handler = handler;
        self
    }

    /// Create the tree and return its root scope.
    pub fn build(self) -> Scope {
        let root = ScopeId::new();
        let mut nodes = HashMap::new();
        nodes.insert(root, Node::root());

        let tree = Tree {
            root,
            nodes: Mutex::new(nodes),
            phase: PhaseCell::default(),
            queues: Mutex::new(Queues::default()),
            config: self.config,
            scheduler: self.scheduler.unwrap_or_else(default_scheduler),
            exception_handler: self.exception_handler,
        };

        tracing::debug!(scope = %root, digest_ttl = tree.config.digest_ttl, "root scope created");

        Scope {
            tree: Arc::new(tree),
            id: root,
        }
    }
}

impl Scope {
    /// Start building a new tree.
    pub fn builder() -> ScopeBuilder {
        ScopeBuilder {
            config: ScopeConfig::default(),
            scheduler: None,
            exception_handler: ExceptionHandler::default(),
        }
    }

    /// A new tree with default configuration.
    pub fn new_root() -> Self {
        Self::builder().build()
    }

    pub(crate) fn from_parts(tree: Arc<Tree>, id: ScopeId) -> Scope {
        Scope { tree, id }
    }

    pub(crate) fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    /// Handle to another scope in the same tree.
    pub(crate) fn sibling_handle(&self, id: ScopeId) -> Scope {
        Scope {
            tree: self.tree.clone(),
            id,
        }
    }

    /// This scope's ID, unique across trees.
    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn is_root(&self) -> bool {
        self.id == self.tree.root
    }

    /// The root of this scope's tree.
    pub fn root(&self) -> Scope {
        self.sibling_handle(self.tree.root)
    }

    /// The parent scope. `None` for the root and for destroyed scopes.
    pub fn parent(&self) -> Option<Scope> {
        self.tree
            .with_node(self.id, |node| node.parent)
            .flatten()
            .map(|id| self.sibling_handle(id))
    }

    /// Live children in creation order.
    pub fn children(&self) -> Vec<Scope> {
        self.child_ids()
            .into_iter()
            .map(|id| self.sibling_handle(id))
            .collect()
    }

    pub(crate) fn child_ids(&self) -> Vec<ScopeId> {
        self.tree
            .with_node(self.id, |node| node.children.clone())
            .unwrap_or_default()
    }

    /// Whether property lookup stops at this scope.
    pub fn is_isolate(&self) -> bool {
        self.tree
            .with_node(self.id, |node| node.isolate)
            .unwrap_or(false)
    }

    pub fn is_destroyed(&self) -> bool {
        !self.tree.contains(self.id)
    }

    pub(crate) fn ensure_alive(&self) -> ScopeResult<()> {
        if self.is_destroyed() {
            return Err(ScopeError::Destroyed(self.id));
        }
        Ok(())
    }

    /// The phase the tree is in, if any.
    pub fn phase(&self) -> Option<Phase> {
        self.tree.phase.current()
    }

    /// Configuration shared by the whole tree.
    pub fn config(&self) -> &ScopeConfig {
        &self.tree.config
    }

    pub fn exception_handler(&self) -> &ExceptionHandler {
        &self.tree.exception_handler
    }

    /// Run scheduled work that waits on the host, such as the digests
    /// queued by `defer` and `apply_async` on a tree built outside a Tokio
    /// runtime. Returns how many jobs ran.
    pub fn run_scheduled(&self) -> usize {
        self.tree.scheduler.run_ready()
    }

    /// Create a child scope, appended after any existing children.
    ///
    /// An isolated child does not inherit its parent's properties. Creating a
    /// child of a destroyed scope returns a handle that is already destroyed.
    pub fn new_child(&self, isolate: bool) -> Scope {
        let id = ScopeId::new();
        let attached = {
            let mut nodes = self.tree.nodes.lock();
            match nodes.get_mut(&self.id) {
                Some(parent) if !parent.destroying => {
                    parent.add_child(id);
                    nodes.insert(id, Node::child(self.id, isolate));
                    true
                }
                _ => false,
            }
        };

        if attached {
            tracing::debug!(scope = %id, parent = %self.id, isolate, "scope created");
        } else {
            tracing::trace!(parent = %self.id, "child of destroyed scope requested");
        }

        self.sibling_handle(id)
    }

    /// Read a property, following the inheritance chain.
    pub fn get(&self, name: &str) -> Value {
        let nodes = self.tree.nodes.lock();
        let mut current = self.id;
        loop {
            let Some(node) = nodes.get(&current) else {
                return Value::Undefined;
            };
            if let Some(value) = node.properties.get(name) {
                return value.clone();
            }
            match node.parent {
                Some(parent) if !node.isolate => current = parent,
                _ => return Value::Undefined,
            }
        }
    }

    /// Read a dotted path such as `user.tags.0`.
    ///
    /// The first segment is looked up like [`Scope::get`]; the rest index
    /// into the resulting value.
    pub fn get_path(&self, path: &str) -> Value {
        let mut segments = path.split('.');
        let Some(first) = segments.next() else {
            return Value::Undefined;
        };
        segments.fold(self.get(first), |value, key| value.get_key(key))
    }

    /// Set an own property.
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let stored = self
            .tree
            .with_node_mut(self.id, |node| {
                node.properties.insert(name.clone(), value.into());
            })
            .is_some();
        if !stored {
            tracing::trace!(scope = %self.id, property = %name, "write to destroyed scope ignored");
        }
    }

    /// Remove an own property, returning its value.
    pub fn remove(&self, name: &str) -> Option<Value> {
        self.tree
            .with_node_mut(self.id, |node| node.properties.shift_remove(name))
            .flatten()
    }

    pub fn has_own(&self, name: &str) -> bool {
        self.tree
            .with_node(self.id, |node| node.properties.contains_key(name))
            .unwrap_or(false)
    }

    /// Names of own properties in insertion order.
    pub fn own_keys(&self) -> Vec<String> {
        self.tree
            .with_node(self.id, |node| node.properties.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of own properties.
    pub fn own_properties(&self) -> IndexMap<String, Value> {
        self.tree
            .with_node(self.id, |node| node.properties.clone())
            .unwrap_or_default()
    }

    /// Destroy this scope and its whole subtree.
    ///
    /// `$destroy` is broadcast first so listeners anywhere in the subtree
    /// can release external resources. Then every node in the subtree is
    /// removed along with its watches, listeners and pending tasks, and this
    /// scope is unlinked from its parent.
    ///
    /// Each scope hears `$destroy` once. Calling `destroy` on any scope of a
    /// subtree already being destroyed, including from a `$destroy`
    /// listener, does nothing.
    pub fn destroy(&self) {
        let Some(marked) = self.tree.mark_destroying(self.id) else {
            return;
        };

        self.broadcast_within(DESTROY_EVENT, Value::Undefined, &marked);

        let removed = self.tree.detach_subtree(self.id, &marked);
        for (_, node) in &removed {
            node.deactivate();
        }

        let ids: HashSet<ScopeId> = removed.iter().map(|(id, _)| *id).collect();
        let discarded = self.tree.queues.lock().discard(&ids);

        tracing::debug!(
            scope = %self.id,
            removed = removed.len(),
            discarded_tasks = discarded.len(),
            "scope destroyed"
        );

        // Dropped outside every lock: captured handles may run Drop code
        drop(discarded);
        drop(removed);
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tree, &other.tree) && self.id == other.id
    }
}

impl Eq for Scope {}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("root", &self.is_root())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
