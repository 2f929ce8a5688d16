//! Scopes
//!
//! This module implements the scope tree and the dirty-checking digest that
//! keeps derived state in sync with the values it depends on.
//!
//! # Concepts
//!
//! ## Scopes
//!
//! A scope is a node in a tree of property maps. Children inherit their
//! parent's properties unless they are isolated. Every scope in a tree
//! shares one digest phase, one set of deferred queues, one scheduler and
//! one exception handler.
//!
//! ## Watches
//!
//! A watch pairs an accessor with a listener. The digest re-runs every
//! accessor in the tree and calls the listener of each watch whose value
//! changed. Listeners may change other values, so the digest repeats whole
//! rounds until one of them comes back clean, or gives up after the
//! configured number of rounds.
//!
//! ## Deferred Work
//!
//! `defer` queues a task for the next digest, `apply_async` batches
//! mutators into one future `apply`, and `post_digest` runs once after the
//! next digest settles.
//!
//! ## Events
//!
//! Named events can be emitted toward the root or broadcast toward the
//! leaves. `destroy` broadcasts `$destroy` before tearing a subtree down.
//!
//! # Implementation Notes
//!
//! Scopes are handles into an arena, so they are cheap to clone and safe to
//! send between threads. All callbacks run without any internal lock held,
//! and callback errors are routed to the tree's `ExceptionHandler` rather
//! than unwinding through the digest. The tree phase is owned by one thread
//! at a time; `apply` and `digest` from another thread wait for it.

mod node;
mod listener;
mod phase;
mod error;
mod exception;
mod scheduler;
mod tree;
mod watch;
mod digest;
mod events;

pub use node::ScopeId;
pub use listener::{Deregistration, ListenerId, WatchId};
pub use phase::Phase;
pub use error::{ScopeError, ScopeResult, WatchChange};
pub use exception::{CallbackError, CallbackOutput, ExceptionHandler};
pub use scheduler::{default_scheduler, Job, ManualScheduler, Scheduler, TokioScheduler};
pub use tree::{Scope, ScopeBuilder};
pub use watch::{BoxedAccessor, Equality, WatchOptions};
pub use events::{Direction, Event, DESTROY_EVENT};
