//! Registration handles.
//!
//! Every watch and event listener gets a unique ID when registered, and
//! registration hands back a `Deregistration` that removes it again.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

impl WatchId {
    /// Generate a new unique watch ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

/// Unique identifier for an event listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Generate a new unique listener ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Handle returned by `watch` and `on`.
///
/// Dropping the handle leaves the registration in place. Call
/// [`Deregistration::deregister`] to remove it; destroying the owning
/// scope removes it as well.
pub struct Deregistration {
    action: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Deregistration {
    pub(crate) fn new<F>(action: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            action: Some(Box::new(action)),
        }
    }

    /// A handle that does nothing, returned for registrations on a
    /// destroyed scope.
    pub(crate) fn noop() -> Self {
        Self { action: None }
    }

    /// Remove the registration.
    pub fn deregister(mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }

    /// Whether deregistering would have any effect.
    pub fn is_noop(&self) -> bool {
        self.action.is_none()
    }
}

impl fmt::Debug for Deregistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deregistration")
            .field("noop", &self.is_noop())
            .finish()
    }
}
