//! Scope Events
//!
//! Named events travel along the scope tree in one of two directions:
//!
//! - `emit` notifies the origin scope, then each ancestor up to the root.
//!   Any listener may call `stop_propagation`; the remaining listeners on the
//!   current scope still run, but no further ancestor is notified.
//! - `broadcast` notifies the origin scope, then every descendant in
//!   pre-order. It cannot be stopped.
//!
//! Listeners on one scope run in registration order. Each scope's listener
//! list is snapshotted before dispatch, so listeners added during dispatch
//! wait for the next event, and listeners removed during dispatch are
//! skipped if they have not run yet.
//!
//! `destroy` broadcasts `$destroy` through the doomed subtree before
//! tearing it down.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use super::exception::{CallbackError, CallbackOutput};
use super::listener::{Deregistration, ListenerId};
use super::node::ScopeId;
use super::tree::Scope;
use crate::value::Value;

/// Broadcast to a subtree just before it is destroyed.
pub const DESTROY_EVENT: &str = "$destroy";

type Callback = Box<dyn Fn(&mut Event, &Value) -> Result<(), CallbackError> + Send + Sync>;

/// A registered event listener.
pub(crate) struct EventListener {
    id: ListenerId,
    callback: Callback,
    active: AtomicBool,
}

impl EventListener {
    pub(crate) fn id(&self) -> ListenerId {
        self.id
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Which way an event travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Toward the root.
    Emit,
    /// Toward the leaves.
    Broadcast,
}

/// The event object handed to listeners.
pub struct Event {
    name: String,
    direction: Direction,
    target: Scope,
    current: Option<Scope>,
    propagation_stopped: bool,
    default_prevented: bool,
}

impl Event {
    fn new(name: &str, direction: Direction, target: Scope) -> Self {
        Self {
            name: name.to_string(),
            direction,
            target,
            current: None,
            propagation_stopped: false,
            default_prevented: false,
        }
    }

    /// The event name listeners were registered for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the event travels up or down.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The scope the event was emitted or broadcast from.
    pub fn target_scope(&self) -> &Scope {
        &self.target
    }

    /// The scope whose listeners are running. `None` once dispatch ends.
    pub fn current_scope(&self) -> Option<&Scope> {
        self.current.as_ref()
    }

    /// Stop an emitted event from reaching further ancestors.
    ///
    /// Has no effect on a broadcast.
    pub fn stop_propagation(&mut self) {
        if self.direction == Direction::Emit {
            self.propagation_stopped = true;
        }
    }

    pub fn is_propagation_stopped(&self) -> bool {
        self.propagation_stopped
    }

    pub fn prevent_default(&mut self) {
        self.default_prevented = true;
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("target", &self.target.id())
            .field("current", &self.current.as_ref().map(Scope::id))
            .field("propagation_stopped", &self.propagation_stopped)
            .field("default_prevented", &self.default_prevented)
            .finish()
    }
}

impl Scope {
    /// Listen for `name` on this scope.
    pub fn on<F, O>(&self, name: &str, listener: F) -> Deregistration
    where
        F: Fn(&mut Event, &Value) -> O + Send + Sync + 'static,
        O: CallbackOutput,
    {
        let entry = Arc::new(EventListener {
            id: ListenerId::new(),
            callback: Box::new(move |event: &mut Event, payload: &Value| {
                listener(event, payload).into_result()
            }),
            active: AtomicBool::new(true),
        });
        let listener_id = entry.id();

        let attached = self
            .tree()
            .with_node_mut(self.id(), |node| {
                node.listeners
                    .entry(name.to_string())
                    .or_default()
                    .push(entry);
            })
            .is_some();
        if !attached {
            return Deregistration::noop();
        }

        let tree = Arc::downgrade(self.tree());
        let scope_id = self.id();
        let name = name.to_string();
        Deregistration::new(move || {
            if let Some(tree) = tree.upgrade() {
                tree.remove_listener(scope_id, &name, listener_id);
            }
        })
    }

    /// Number of listeners for `name` registered directly on this scope.
    pub fn listener_count(&self, name: &str) -> usize {
        self.tree()
            .with_node(self.id(), |node| node.listener_count(name))
            .unwrap_or(0)
    }

    /// Dispatch `name` to this scope and then each ancestor.
    pub fn emit(&self, name: &str, payload: impl Into<Value>) -> Event {
        let payload = payload.into();
        let mut event = Event::new(name, Direction::Emit, self.clone());

        let mut next = Some(self.id());
        while let Some(id) = next {
            // Read the parent first: a listener may destroy this scope
            let Some(parent) = self.tree().with_node(id, |node| node.parent) else {
                break;
            };
            self.sibling_handle(id).dispatch(&mut event, &payload);
            if event.propagation_stopped {
                break;
            }
            next = parent;
        }

        event.current = None;
        event
    }

    /// Dispatch `name` to this scope and every descendant, in pre-order.
    pub fn broadcast(&self, name: &str, payload: impl Into<Value>) -> Event {
        self.broadcast_where(name, payload.into(), |_| true)
    }

    /// Broadcast that only visits scopes in `scopes`, skipping the subtree
    /// below any scope outside it.
    pub(crate) fn broadcast_within(
        &self,
        name: &str,
        payload: Value,
        scopes: &HashSet<ScopeId>,
    ) -> Event {
        self.broadcast_where(name, payload, |id| scopes.contains(&id))
    }

    fn broadcast_where(&self, name: &str, payload: Value, visit: impl Fn(ScopeId) -> bool) -> Event {
        let mut event = Event::new(name, Direction::Broadcast, self.clone());

        let mut stack: SmallVec<[ScopeId; 16]> = SmallVec::new();
        stack.push(self.id());
        while let Some(id) = stack.pop() {
            let scope = self.sibling_handle(id);
            if !visit(id) || scope.is_destroyed() {
                continue;
            }
            scope.dispatch(&mut event, &payload);
            stack.extend(scope.child_ids().into_iter().rev());
        }

        event.current = None;
        event
    }

    /// Run this scope's listeners for `event`.
    fn dispatch(&self, event: &mut Event, payload: &Value) {
        let listeners = self
            .tree()
            .with_node(self.id(), |node| node.listeners.get(event.name()).cloned())
            .flatten()
            .unwrap_or_default();
        if listeners.is_empty() {
            return;
        }

        event.current = Some(self.clone());
        for listener in listeners {
            if !listener.is_active() {
                continue;
            }
            if let Err(error) = (listener.callback)(event, payload) {
                let context = format!("event listener for '{}'", event.name());
                self.tree().report(&error, &context);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{ExceptionHandler, ManualScheduler};
    use parking_lot::Mutex;

    fn root() -> Scope {
        Scope::builder()
            .scheduler(Arc::new(ManualScheduler::new()))
            .build()
    }

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn emit_travels_child_to_root() {
        let root = root();
        let child = root.new_child(false);
        let grandchild = child.new_child(false);
        let log = recorder();

        for (scope, label) in [(&root, "root"), (&child, "child"), (&grandchild, "grandchild")] {
            let log = log.clone();
            let _h = scope.on("ping", move |event: &mut Event, _: &Value| {
                let at_target = event.current_scope() == Some(event.target_scope());
                log.lock().push(format!("{label}:{at_target}"));
            });
        }

        let event = grandchild.emit("ping", Value::Undefined);

        assert_eq!(
            *log.lock(),
            vec!["grandchild:true", "child:false", "root:false"]
        );
        assert!(event.current_scope().is_none());
        assert_eq!(event.target_scope(), &grandchild);
    }

    #[test]
    fn stop_propagation_skips_ancestors_but_not_siblings() {
        let root = root();
        let child = root.new_child(false);
        let grandchild = child.new_child(false);
        let log = recorder();

        let log_stop = log.clone();
        let _h1 = child.on("ping", move |event: &mut Event, _: &Value| {
            log_stop.lock().push("child-stop".to_string());
            event.stop_propagation();
        });
        let log_after = log.clone();
        let _h2 = child.on("ping", move |_: &mut Event, _: &Value| {
            log_after.lock().push("child-after".to_string());
        });
        let log_root = log.clone();
        let _h3 = root.on("ping", move |_: &mut Event, _: &Value| {
            log_root.lock().push("root".to_string());
        });

        let event = grandchild.emit("ping", Value::Undefined);

        assert_eq!(*log.lock(), vec!["child-stop", "child-after"]);
        assert!(event.is_propagation_stopped());
    }

    #[test]
    fn broadcast_visits_descendants_in_pre_order() {
        let root = root();
        let a = root.new_child(false);
        let a1 = a.new_child(true);
        let b = root.new_child(false);
        let log = recorder();

        for (scope, label) in [(&b, "b"), (&a1, "a1"), (&root, "root"), (&a, "a")] {
            let log = log.clone();
            let _h = scope.on("refresh", move |event: &mut Event, payload: &Value| {
                event.stop_propagation();
                log.lock().push(format!("{label}:{}", payload.as_i64().unwrap_or(-1)));
            });
        }

        let event = root.broadcast("refresh", 7);

        assert_eq!(*log.lock(), vec!["root:7", "a:7", "a1:7", "b:7"]);
        assert!(!event.is_propagation_stopped());
    }

    #[test]
    fn prevent_default_is_reported_back() {
        let root = root();
        let _h = root.on("leave", |event: &mut Event, _: &Value| event.prevent_default());
        assert!(root.emit("leave", Value::Undefined).default_prevented());
        assert!(!root.emit("other", Value::Undefined).default_prevented());
    }

    #[test]
    fn deregistered_listener_is_not_called() {
        let root = root();
        let log = recorder();

        let log_clone = log.clone();
        let handle = root.on("ping", move |_: &mut Event, _: &Value| {
            log_clone.lock().push("called".to_string());
        });
        assert_eq!(root.listener_count("ping"), 1);

        handle.deregister();
        root.emit("ping", Value::Undefined);

        assert!(log.lock().is_empty());
        assert_eq!(root.listener_count("ping"), 0);
    }

    #[test]
    fn failing_listener_is_reported_and_dispatch_continues() {
        let errors = recorder();
        let errors_clone = errors.clone();
        let root = Scope::builder()
            .scheduler(Arc::new(ManualScheduler::new()))
            .exception_handler(ExceptionHandler::new(move |error, context| {
                errors_clone.lock().push(format!("{context}: {error}"));
            }))
            .build();
        let child = root.new_child(false);
        let log = recorder();

        let _h1 = child.on("ping", |_: &mut Event, _: &Value| -> Result<(), CallbackError> {
            Err("listener broke".into())
        });
        let log_clone = log.clone();
        let _h2 = root.on("ping", move |_: &mut Event, _: &Value| {
            log_clone.lock().push("root".to_string());
        });

        child.emit("ping", Value::Undefined);

        assert_eq!(*log.lock(), vec!["root"]);
        assert_eq!(
            *errors.lock(),
            vec!["event listener for 'ping': listener broke".to_string()]
        );
    }

    #[test]
    fn destroy_broadcasts_to_whole_subtree_once() {
        let root = root();
        let child = root.new_child(false);
        let grandchild = child.new_child(false);
        let log = recorder();

        for (scope, label) in [(&child, "child"), (&grandchild, "grandchild"), (&root, "root")] {
            let log = log.clone();
            let _h = scope.on(DESTROY_EVENT, move |event: &mut Event, _: &Value| {
                log.lock().push(label.to_string());
                // Re-entrant destroy from a teardown listener is ignored
                event.target_scope().destroy();
            });
        }

        child.destroy();
        child.destroy();

        assert_eq!(*log.lock(), vec!["child", "grandchild"]);
        assert_eq!(grandchild.listener_count(DESTROY_EVENT), 0);
    }

    #[test]
    fn descendant_destroying_itself_hears_destroy_once() {
        let root = root();
        let child = root.new_child(false);
        let grandchild = child.new_child(false);
        let log = recorder();

        let log_clone = log.clone();
        let own = grandchild.clone();
        let _h = grandchild.on(DESTROY_EVENT, move |_: &mut Event, _: &Value| {
            log_clone.lock().push("grandchild".to_string());
            own.destroy();
        });

        child.destroy();

        assert_eq!(*log.lock(), vec!["grandchild"]);
        assert!(grandchild.is_destroyed());
        assert!(root.children().is_empty());
    }

    #[test]
    fn destroying_ancestor_from_teardown_skips_subtree_in_progress() {
        let root = root();
        let child = root.new_child(false);
        let grandchild = child.new_child(false);
        let leaf = grandchild.new_child(false);
        let log = recorder();

        let log_child = log.clone();
        let _c = child.on(DESTROY_EVENT, move |_: &mut Event, _: &Value| {
            log_child.lock().push("child".to_string());
        });
        let log_leaf = log.clone();
        let _l = leaf.on(DESTROY_EVENT, move |_: &mut Event, _: &Value| {
            log_leaf.lock().push("leaf".to_string());
        });
        let log_grandchild = log.clone();
        let parent = child.clone();
        let _g = grandchild.on(DESTROY_EVENT, move |_: &mut Event, _: &Value| {
            log_grandchild.lock().push("grandchild".to_string());
            parent.destroy();
        });

        grandchild.destroy();

        assert_eq!(*log.lock(), vec!["grandchild", "child", "leaf"]);
        assert!(child.is_destroyed());
        assert!(leaf.is_destroyed());
        assert!(root.children().is_empty());
    }
}
