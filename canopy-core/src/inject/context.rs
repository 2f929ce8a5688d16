//! Resolution Context
//!
//! Tracks which names are being resolved so that a dependency cycle fails
//! instead of recursing forever.
//!
//! # Implementation
//!
//! Each thread keeps a stack of `(injector, name)` entries. Resolving a name
//! pushes it; the guard pops it when dropped, on success, on error and on
//! unwind alike. A name that is already on the stack for the same injector
//! is a cycle. Entries are tagged with the injector so that one injector
//! resolving through another does not trip a false cycle.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::{render_path, InjectError, InjectResult};

/// Unique identifier for an injector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct InjectorId(u64);

impl InjectorId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

thread_local! {
    static RESOLVING: RefCell<Vec<(InjectorId, String)>> = const { RefCell::new(Vec::new()) };
}

/// Guard that pops the resolution stack when dropped.
pub(crate) struct Resolution {
    injector: InjectorId,
    name: String,
}

impl Resolution {
    /// Start resolving `name`, failing if it is already being resolved.
    pub(crate) fn enter(injector: InjectorId, name: &str) -> InjectResult<Self> {
        RESOLVING.with(|stack| {
            let mut stack = stack.borrow_mut();
            let names = Self::names(&stack, injector);
            if names.contains(&name) {
                let path = render_path(name, names.into_iter());
                return Err(InjectError::CircularDependency { path });
            }
            stack.push((injector, name.to_string()));
            Ok(Self {
                injector,
                name: name.to_string(),
            })
        })
    }

    /// Render the current path for `name`, which is about to fail.
    pub(crate) fn path(injector: InjectorId, name: &str) -> String {
        RESOLVING.with(|stack| render_path(name, Self::names(&stack.borrow(), injector).into_iter()))
    }

    fn names(stack: &[(InjectorId, String)], injector: InjectorId) -> Vec<&str> {
        stack
            .iter()
            .filter(|(id, _)| *id == injector)
            .map(|(_, entry)| entry.as_str())
            .collect()
    }
}

impl Drop for Resolution {
    fn drop(&mut self) {
        RESOLVING.with(|stack| {
            let popped = stack.borrow_mut().pop();

            if let Some((injector, name)) = popped {
                debug_assert!(
                    injector == self.injector && name == self.name,
                    "Resolution mismatch: expected {:?}, got {:?}",
                    self.name,
                    name
                );
            }
        });
    }
}
