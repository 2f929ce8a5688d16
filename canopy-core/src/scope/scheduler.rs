//! Digest Scheduler
//!
//! `defer` and `apply_async` need a digest to happen "soon" even when the
//! caller is outside any `apply`. The tree does not own an event loop, so it
//! asks a `Scheduler` to run a job later.
//!
//! # Coalescing
//!
//! The tree keeps at most one pending flush per queue. Every call made
//! before the job runs piggybacks on it, so n near-simultaneous requests
//! cost one digest, not n.
//!
//! # Implementations
//!
//! - `ManualScheduler` queues jobs until `run_pending` is called. Useful in
//!   tests and in hosts that drive their own loop. Outside a Tokio runtime
//!   it is the default, and the host drains it through
//!   `Scope::run_scheduled`.
//! - `TokioScheduler` spawns jobs onto a Tokio runtime behind a
//!   `yield_now`, so they run after the current task gives up control.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;

/// A unit of scheduled work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run a job later.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, job: Job);

    /// Run the jobs that wait on the host. Returns how many ran.
    ///
    /// Schedulers that run jobs on their own have none.
    fn run_ready(&self) -> usize {
        0
    }
}

/// A scheduler that runs nothing until told to.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<VecDeque<Job>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run the oldest job. Returns `false` if there was none.
    pub fn run_next(&self) -> bool {
        // Pop before running so the job may schedule more work
        let job = self.queue.lock().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run jobs until the queue is empty, including jobs scheduled by the
    /// jobs themselves. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while self.run_next() {
            ran += 1;
        }
        ran
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, job: Job) {
        self.queue.lock().push_back(job);
    }

    fn run_ready(&self) -> usize {
        self.run_pending()
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

/// A scheduler backed by a Tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running on, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, job: Job) {
        self.handle.spawn(async move {
            tokio::task::yield_now().await;
            job();
        });
    }
}

/// The Tokio scheduler when called inside a runtime, otherwise a manual one.
pub fn default_scheduler() -> Arc<dyn Scheduler> {
    match TokioScheduler::current() {
        Some(tokio) => Arc::new(tokio),
        None => {
            tracing::warn!("no tokio runtime; deferred digests run only when the host calls run_scheduled");
            Arc::new(ManualScheduler::new())
        }
    }
}
