//! Watch Registry
//!
//! A watch is an (accessor, listener) pair registered on a scope. Every
//! digest round re-runs the accessor and compares the result with the value
//! seen last time. When they differ, the listener is called with the new
//! value, the old value and the owning scope.
//!
//! # Registration
//!
//! The accessor runs once at registration and its result becomes the
//! baseline. The listener is not called for that baseline unless the watch
//! opts in with `WatchOptions::fire_initial`, in which case it is called
//! synchronously, before `watch_with` returns, with `new == old`.
//!
//! # Equality
//!
//! - `Identity` fires when a container is replaced, even by an equal one.
//! - `Shallow` fires when the top level of a container changes.
//! - `Deep` fires only on a structural change.
//!
//! # One-shot watches
//!
//! A `once` watch removes itself the first time its listener fires after
//! registration. The optional initial call does not count.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::exception::{CallbackError, CallbackOutput};
use super::listener::{Deregistration, WatchId};
use super::tree::Scope;
use crate::value::Value;

/// A boxed accessor, as taken by [`Scope::watch_group`].
pub type BoxedAccessor = Box<dyn Fn(&Scope) -> Value + Send + Sync>;

pub(crate) type Listener =
    Box<dyn Fn(&Value, &Value, &Scope) -> Result<(), CallbackError> + Send + Sync>;

/// How a watch decides whether its value changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Equality {
    #[default]
    Identity,
    Shallow,
    Deep,
}

impl Equality {
    /// Whether `a` and `b` count as the same value under this mode.
    pub fn same(self, a: &Value, b: &Value) -> bool {
        match self {
            Equality::Identity => a.identical(b),
            Equality::Shallow => a.shallow_eq(b),
            Equality::Deep => a.deep_eq(b),
        }
    }
}

/// Options for [`Scope::watch_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    pub equality: Equality,
    /// Deregister after the first change is delivered.
    pub once: bool,
    /// Call the listener once at registration with the current value.
    pub fire_initial: bool,
}

impl WatchOptions {
    pub fn deep() -> Self {
        Self {
            equality: Equality::Deep,
            ..Self::default()
        }
    }

    pub fn shallow() -> Self {
        Self {
            equality: Equality::Shallow,
            ..Self::default()
        }
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn fire_initial(mut self) -> Self {
        self.fire_initial = true;
        self
    }
}

/// A registered watch.
pub(crate) struct Watch {
    id: WatchId,
    accessor: BoxedAccessor,
    listener: Listener,
    last: Mutex<Value>,
    equality: Equality,
    once: bool,
    active: AtomicBool,
}

impl Watch {
    pub(crate) fn new(
        accessor: BoxedAccessor,
        listener: Listener,
        initial: Value,
        options: WatchOptions,
    ) -> Self {
        Self {
            id: WatchId::new(),
            accessor,
            listener,
            last: Mutex::new(initial),
            equality: options.equality,
            once: options.once,
            active: AtomicBool::new(true),
        }
    }

    pub(crate) fn id(&self) -> WatchId {
        self.id
    }

    pub(crate) fn is_once(&self) -> bool {
        self.once
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Re-run the accessor. If the value changed, record it as the new
    /// baseline and return `(new, old)`.
    pub(crate) fn check(&self, scope: &Scope) -> Option<(Value, Value)> {
        let current = (self.accessor)(scope);
        let mut last = self.last.lock();
        if self.equality.same(&current, &last) {
            return None;
        }
        let old = std::mem::replace(&mut *last, current.clone());
        Some((current, old))
    }

    pub(crate) fn notify(
        &self,
        new_value: &Value,
        old_value: &Value,
        scope: &Scope,
    ) -> Result<(), CallbackError> {
        (self.listener)(new_value, old_value, scope)
    }
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("id", &self.id)
            .field("equality", &self.equality)
            .field("once", &self.once)
            .field("active", &self.is_active())
            .field("last", &*self.last.lock())
            .finish()
    }
}

impl Scope {
    /// Watch `accessor` by identity.
    pub fn watch<A, L, O>(&self, accessor: A, listener: L) -> Deregistration
    where
        A: Fn(&Scope) -> Value + Send + Sync + 'static,
        L: Fn(&Value, &Value, &Scope) -> O + Send + Sync + 'static,
        O: CallbackOutput,
    {
        self.watch_with(accessor, listener, WatchOptions::default())
    }

    /// Watch `accessor` with structural equality.
    pub fn watch_deep<A, L, O>(&self, accessor: A, listener: L) -> Deregistration
    where
        A: Fn(&Scope) -> Value + Send + Sync + 'static,
        L: Fn(&Value, &Value, &Scope) -> O + Send + Sync + 'static,
        O: CallbackOutput,
    {
        self.watch_with(accessor, listener, WatchOptions::deep())
    }

    /// Watch the top level of an array or object.
    pub fn watch_collection<A, L, O>(&self, accessor: A, listener: L) -> Deregistration
    where
        A: Fn(&Scope) -> Value + Send + Sync + 'static,
        L: Fn(&Value, &Value, &Scope) -> O + Send + Sync + 'static,
        O: CallbackOutput,
    {
        self.watch_with(accessor, listener, WatchOptions::shallow())
    }

    /// Watch several accessors at once.
    ///
    /// The listener receives arrays holding every accessor's value, and fires
    /// at most once per round no matter how many of them changed.
    pub fn watch_group<L, O>(
        &self,
        accessors: Vec<BoxedAccessor>,
        listener: L,
    ) -> Deregistration
    where
        L: Fn(&Value, &Value, &Scope) -> O + Send + Sync + 'static,
        O: CallbackOutput,
    {
        self.watch_with(
            move |scope| Value::array(accessors.iter().map(|accessor| accessor(scope))),
            listener,
            WatchOptions::shallow(),
        )
    }

    /// Register a watch.
    pub fn watch_with<A, L, O>(&self, accessor: A, listener: L, options: WatchOptions) -> Deregistration
    where
        A: Fn(&Scope) -> Value + Send + Sync + 'static,
        L: Fn(&Value, &Value, &Scope) -> O + Send + Sync + 'static,
        O: CallbackOutput,
    {
        if self.is_destroyed() {
            tracing::trace!(scope = %self.id(), "watch on destroyed scope ignored");
            return Deregistration::noop();
        }

        let initial = accessor(self);
        let watch = Arc::new(Watch::new(
            Box::new(accessor),
            Box::new(move |new: &Value, old: &Value, scope: &Scope| {
                listener(new, old, scope).into_result()
            }),
            initial.clone(),
            options,
        ));
        let watch_id = watch.id();

        let attached = self
            .tree()
            .with_node_mut(self.id(), |node| node.watches.push(watch.clone()))
            .is_some();
        if !attached {
            return Deregistration::noop();
        }

        tracing::trace!(scope = %self.id(), watch = %watch_id, ?options, "watch registered");

        if options.fire_initial {
            if let Err(error) = watch.notify(&initial, &initial, self) {
                self.tree().report(&error, "watch listener");
            }
        }

        let tree = Arc::downgrade(self.tree());
        let scope_id = self.id();
        Deregistration::new(move || {
            if let Some(tree) = tree.upgrade() {
                tree.remove_watch(scope_id, watch_id);
            }
        })
    }

    /// Number of watches registered directly on this scope.
    pub fn watch_count(&self) -> usize {
        self.tree()
            .with_node(self.id(), |node| node.watches.len())
            .unwrap_or(0)
    }
}
