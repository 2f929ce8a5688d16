//! Digest Engine
//!
//! The digest is a dirty-checking fixed-point computation over a scope
//! subtree. It is single-threaded and runs to completion once started.
//!
//! # How It Works
//!
//! 1. Drain the deferred queue in FIFO order. Tasks may defer more tasks;
//!    those run in the same drain.
//!
//! 2. Walk the subtree in pre-order (scope, then children left to right).
//!    For every live watch on every live scope, re-run the accessor and
//!    compare against the last value. On a change, record the new value and
//!    call the listener right away.
//!
//! 3. If the round saw a change, or left deferred tasks behind, run another
//!    round. Stop when a round is clean. If `digest_ttl` rounds have run and
//!    the last one was still dirty, fail with `UnstableWatchers`.
//!
//! 4. Leave the digest phase, then run `post_digest` tasks.
//!
//! Listener and task failures are routed to the exception handler one at a
//! time, and the walk continues. Nothing from completed rounds is rolled
//! back when the digest fails.
//!
//! # Structural changes during a round
//!
//! Listeners may create or destroy scopes mid-round. Each scope's watch list
//! and child list are snapshotted when the walk reaches it, and every entry
//! is re-checked for liveness before use, so a destroyed subtree is never
//! entered and its watches never fire again.
//!
//! # Entry points
//!
//! - `digest` processes this scope's subtree and never looks at ancestors.
//! - `apply` runs a mutator and then digests from the root. Inside an active
//!   phase it only runs the mutator; the running digest sees the change.
//! - `defer` queues a task for the next digest, scheduling one if the tree
//!   is idle.
//! - `apply_async` queues a mutator; all mutators queued before the flush
//!   runs are applied together, followed by a single digest.
//! - `post_digest` queues a task for after the next digest settles.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use super::error::{ScopeError, ScopeResult, WatchChange};
use super::exception::{CallbackError, CallbackOutput};
use super::node::ScopeId;
use super::phase::Phase;
use super::tree::{Scope, Tree};

type Task = Box<dyn FnOnce(&Scope) -> Result<(), CallbackError> + Send + 'static>;

/// A task bound to the scope it was queued on.
pub(crate) struct ScopedTask {
    scope: ScopeId,
    task: Task,
}

impl ScopedTask {
    fn new<F, O>(scope: ScopeId, task: F) -> Self
    where
        F: FnOnce(&Scope) -> O + Send + 'static,
        O: CallbackOutput,
    {
        Self {
            scope,
            task: Box::new(move |scope: &Scope| task(scope).into_result()),
        }
    }

    /// Run against the owning scope unless it has been destroyed.
    fn run(self, any: &Scope, context: &str) {
        let target = any.sibling_handle(self.scope);
        if target.is_destroyed() {
            tracing::trace!(scope = %self.scope, context, "task for destroyed scope skipped");
            return;
        }
        if let Err(error) = (self.task)(&target) {
            target.tree().report(&error, context);
        }
    }
}

/// Pending work for one tree.
#[derive(Default)]
pub(crate) struct Queues {
    deferred: VecDeque<ScopedTask>,
    apply_async: VecDeque<ScopedTask>,
    post_digest: VecDeque<ScopedTask>,
    flush_scheduled: bool,
    apply_async_scheduled: bool,
}

impl Queues {
    /// Remove every task bound to one of `scopes`.
    pub(crate) fn discard(&mut self, scopes: &HashSet<ScopeId>) -> Vec<ScopedTask> {
        let mut discarded = Vec::new();
        for queue in [
            &mut self.deferred,
            &mut self.apply_async,
            &mut self.post_digest,
        ] {
            let (gone, kept): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|t| scopes.contains(&t.scope));
            *queue = kept;
            discarded.extend(gone);
        }
        discarded
    }

    pub(crate) fn deferred_len(&self) -> usize {
        self.deferred.len()
    }
}

impl Tree {
    /// Schedule a digest of the root to drain the deferred queue.
    fn schedule_flush(self: &Arc<Self>) {
        let tree = Arc::downgrade(self);
        self.scheduler.schedule(Box::new(move || {
            if let Some(tree) = tree.upgrade() {
                Tree::run_scheduled_flush(&tree);
            }
        }));
    }

    fn run_scheduled_flush(tree: &Arc<Tree>) {
        let pending = {
            let mut queues = tree.queues.lock();
            queues.flush_scheduled = false;
            !queues.deferred.is_empty()
        };
        // An owning phase on this thread drains the queue before it settles.
        // A phase owned by another thread makes `digest` wait its turn.
        if !pending || tree.phase.held_here().is_some() {
            return;
        }

        let root = Scope::from_parts(tree.clone(), tree.root);
        if root.is_destroyed() {
            return;
        }
        tracing::trace!("running scheduled digest");
        if let Err(error) = root.digest() {
            tree.report(&CallbackError::from(error), "scheduled digest");
        }
    }

    fn schedule_apply_async(self: &Arc<Self>) {
        let tree = Arc::downgrade(self);
        self.scheduler.schedule(Box::new(move || {
            if let Some(tree) = tree.upgrade() {
                Tree::run_scheduled_apply(&tree);
            }
        }));
    }

    fn run_scheduled_apply(tree: &Arc<Tree>) {
        if tree.queues.lock().apply_async.is_empty() {
            return;
        }

        let root = Scope::from_parts(tree.clone(), tree.root);
        if root.is_destroyed() {
            return;
        }
        tracing::trace!("running scheduled apply");
        if let Err(error) = root.apply(|root| root.flush_apply_async()) {
            tree.report(&CallbackError::from(error), "scheduled apply");
        }
    }
}

impl Scope {
    /// Run a digest pass over this scope and its descendants.
    ///
    /// Fails with `DigestInProgress` if the calling thread is already inside
    /// a phase, and with `UnstableWatchers` if the watches do not settle
    /// within the configured TTL. A phase owned by another thread is waited
    /// out first.
    ///
    /// After `UnstableWatchers`, post-digest tasks and any deferred tasks
    /// the last round queued are kept. They run with the next digest, which
    /// is not scheduled automatically.
    pub fn digest(&self) -> ScopeResult<()> {
        self.ensure_alive()?;

        {
            let _phase = self.tree().phase.begin(Phase::Digest)?;
            if self.is_root() {
                self.flush_apply_async();
            }
            self.run_rounds()?;
        }

        self.run_post_digest();
        Ok(())
    }

    fn run_rounds(&self) -> ScopeResult<()> {
        let ttl = self.tree().config.digest_ttl;
        let mut rounds = 0;

        loop {
            self.drain_deferred();

            rounds += 1;
            let changes = self.run_round();
            let pending = self.tree().queues.lock().deferred_len();

            tracing::trace!(scope = %self.id(), round = rounds, changes = changes.len(), pending, "digest round");

            if changes.is_empty() && pending == 0 {
                tracing::debug!(scope = %self.id(), rounds, "digest settled");
                return Ok(());
            }

            if rounds >= ttl {
                tracing::warn!(scope = %self.id(), ttl, changes = changes.len(), "digest did not settle");
                return Err(ScopeError::UnstableWatchers { ttl, changes });
            }
        }
    }

    /// One pre-order walk over the subtree. Returns the changes it saw.
    fn run_round(&self) -> Vec<WatchChange> {
        let tree = self.tree();
        let mut changes = Vec::new();
        let mut stack = vec![self.id()];

        while let Some(id) = stack.pop() {
            let Some(watches) = tree.with_node(id, |node| node.watches.clone()) else {
                continue;
            };
            let scope = self.sibling_handle(id);

            for watch in watches {
                if !watch.is_active() {
                    continue;
                }
                if scope.is_destroyed() {
                    break;
                }

                let Some((new_value, old_value)) = watch.check(&scope) else {
                    continue;
                };

                if watch.is_once() {
                    tree.remove_watch(id, watch.id());
                }

                if let Err(error) = watch.notify(&new_value, &old_value, &scope) {
                    tree.report(&error, "watch listener");
                }

                changes.push(WatchChange {
                    scope: id,
                    watch: watch.id(),
                    new_value,
                    old_value,
                });
            }

            let children = tree.with_node(id, |node| node.children.clone()).unwrap_or_default();
            stack.extend(children.into_iter().rev());
        }

        changes
    }

    fn drain_deferred(&self) {
        loop {
            let next = self.tree().queues.lock().deferred.pop_front();
            match next {
                Some(task) => task.run(self, "deferred task"),
                None => break,
            }
        }
    }

    fn run_post_digest(&self) {
        loop {
            let next = self.tree().queues.lock().post_digest.pop_front();
            match next {
                Some(task) => task.run(self, "post-digest task"),
                None => break,
            }
        }
    }

    /// Apply every queued `apply_async` mutator.
    fn flush_apply_async(&self) {
        let tasks = {
            let mut queues = self.tree().queues.lock();
            queues.apply_async_scheduled = false;
            std::mem::take(&mut queues.apply_async)
        };
        if !tasks.is_empty() {
            tracing::trace!(count = tasks.len(), "flushing apply_async queue");
        }
        for task in tasks {
            task.run(self, "apply_async mutator");
        }
    }

    /// Run `mutator` and then digest the whole tree.
    ///
    /// A failing mutator is reported to the exception handler and the
    /// digest still runs. Called while the tree is already applying or
    /// digesting on this thread, the mutator runs inline and no new digest
    /// starts. Called from another thread, it waits until the tree is idle.
    pub fn apply<F, O>(&self, mutator: F) -> ScopeResult<()>
    where
        F: FnOnce(&Scope) -> O,
        O: CallbackOutput,
    {
        self.ensure_alive()?;

        if let Some(phase) = self.tree().phase.held_here() {
            tracing::trace!(scope = %self.id(), %phase, "nested apply runs inline");
            if let Err(error) = mutator(self).into_result() {
                self.tree().report(&error, "apply mutator");
            }
            return Ok(());
        }

        {
            let _phase = self.tree().phase.begin(Phase::Apply)?;
            if let Err(error) = mutator(self).into_result() {
                self.tree().report(&error, "apply mutator");
            }
        }

        self.root().digest()
    }

    /// Queue `task` to run before the next digest round.
    ///
    /// Unless this thread is already inside a phase or a flush is pending, a
    /// digest of the root is scheduled on the tree's scheduler. Tasks queued on a scope that is
    /// destroyed before they run are dropped.
    pub fn defer<F, O>(&self, task: F)
    where
        F: FnOnce(&Scope) -> O + Send + 'static,
        O: CallbackOutput,
    {
        if self.is_destroyed() {
            tracing::trace!(scope = %self.id(), "defer on destroyed scope ignored");
            return;
        }

        let idle = self.tree().phase.held_here().is_none();
        let schedule = {
            let mut queues = self.tree().queues.lock();
            queues.deferred.push_back(ScopedTask::new(self.id(), task));
            let schedule = idle && !queues.flush_scheduled;
            if schedule {
                queues.flush_scheduled = true;
            }
            schedule
        };

        if schedule {
            tracing::trace!(scope = %self.id(), "digest scheduled");
            self.tree().schedule_flush();
        }
    }

    /// Queue `mutator` to be applied on the next scheduled flush.
    ///
    /// All mutators queued before the flush runs share one `apply` and one
    /// digest. A digest of the root started in the meantime applies them
    /// first instead.
    pub fn apply_async<F, O>(&self, mutator: F)
    where
        F: FnOnce(&Scope) -> O + Send + 'static,
        O: CallbackOutput,
    {
        if self.is_destroyed() {
            tracing::trace!(scope = %self.id(), "apply_async on destroyed scope ignored");
            return;
        }

        let schedule = {
            let mut queues = self.tree().queues.lock();
            queues.apply_async.push_back(ScopedTask::new(self.id(), mutator));
            !std::mem::replace(&mut queues.apply_async_scheduled, true)
        };

        if schedule {
            self.tree().schedule_apply_async();
        }
    }

    /// Queue `task` to run once after the next digest settles.
    ///
    /// Does not schedule a digest by itself.
    pub fn post_digest<F, O>(&self, task: F)
    where
        F: FnOnce(&Scope) -> O + Send + 'static,
        O: CallbackOutput,
    {
        if self.is_destroyed() {
            return;
        }
        self.tree()
            .queues
            .lock()
            .post_digest
            .push_back(ScopedTask::new(self.id(), task));
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::{BoxedAccessor, ExceptionHandler, ManualScheduler, WatchOptions};
    use crate::value::Value;
    use crate::config::ScopeConfig;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI32, Ordering};

    struct Harness {
        root: Scope,
        scheduler: Arc<ManualScheduler>,
        errors: Arc<Mutex<Vec<String>>>,
    }

    fn harness() -> Harness {
        harness_with_ttl(10)
    }

    fn harness_with_ttl(ttl: usize) -> Harness {
        let scheduler = Arc::new(ManualScheduler::new());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors_clone = errors.clone();
        let root = Scope::builder()
            .config(ScopeConfig { digest_ttl: ttl })
            .scheduler(scheduler.clone())
            .exception_handler(ExceptionHandler::new(move |error, context| {
                errors_clone.lock().push(format!("{context}: {error}"));
            }))
            .build();
        Harness {
            root,
            scheduler,
            errors,
        }
    }

    fn counter() -> (Arc<AtomicI32>, Arc<AtomicI32>) {
        let count = Arc::new(AtomicI32::new(0));
        (count.clone(), count)
    }

    #[test]
    fn listener_receives_new_and_old_value() {
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let _w = h.root.watch(
            |s| s.get("count"),
            move |new, old, _| seen_clone.lock().push((new.clone(), old.clone())),
        );

        h.root.apply(|s| s.set("count", 1)).unwrap();
        h.root.apply(|s| s.set("count", 1)).unwrap();
        h.root.apply(|s| s.set("count", 2)).unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                (Value::from(1), Value::Undefined),
                (Value::from(2), Value::from(1)),
            ]
        );
    }

    #[test]
    fn listeners_fire_in_pre_order() {
        let h = harness();
        let order = Arc::new(Mutex::new(Vec::new()));

        let a = h.root.new_child(false);
        let a1 = a.new_child(false);
        let b = h.root.new_child(false);

        for (scope, label) in [(&b, "b"), (&a1, "a1"), (&h.root, "root"), (&a, "a")] {
            let order = order.clone();
            let _w = scope.watch(|s| s.get("tick"), move |_, _, _| order.lock().push(label));
        }

        h.root.apply(|s| s.set("tick", 1)).unwrap();
        assert_eq!(*order.lock(), vec!["root", "a", "a1", "b"]);
    }

    #[test]
    fn cascading_listeners_settle_in_later_rounds() {
        let h = harness();

        let _w1 = h.root.watch(
            |s| s.get("a"),
            |new, _, s| s.set("b", new.as_i64().unwrap_or(0) * 2),
        );
        let (calls, calls_clone) = counter();
        let _w2 = h.root.watch(
            |s| s.get("b"),
            move |_, _, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        h.root.apply(|s| s.set("a", 5)).unwrap();
        assert_eq!(h.root.get("b"), Value::from(10));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unstable_watch_fails_after_exactly_ttl_rounds() {
        let h = harness_with_ttl(10);
        let (calls, calls_clone) = counter();

        let _w = h.root.watch(
            |s| s.get("n"),
            move |new, _, s| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                s.set("n", new.as_i64().unwrap_or(0) + 1);
            },
        );

        let err = h.root.apply(|s| s.set("n", 1)).unwrap_err();
        match err {
            ScopeError::UnstableWatchers { ttl, changes } => {
                assert_eq!(ttl, 10);
                assert_eq!(changes.len(), 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 10);

        // Side effects of completed rounds stay applied
        assert_eq!(h.root.get("n"), Value::from(11));
        assert!(h.root.phase().is_none());
    }

    #[test]
    fn ping_pong_watches_are_unstable() {
        let h = harness_with_ttl(4);

        let _w1 = h.root.watch(
            |s| s.get("flag"),
            |new, _, s| s.set("other", !new.is_truthy()),
        );
        let _w2 = h.root.watch(
            |s| s.get("other"),
            |new, _, s| s.set("flag", new.is_truthy()),
        );

        let result = h.root.apply(|s| s.set("flag", true));
        assert!(matches!(result, Err(ScopeError::UnstableWatchers { ttl: 4, .. })));
    }

    #[test]
    fn failing_listener_does_not_stop_others() {
        let h = harness();
        let (calls, calls_clone) = counter();

        let _w1 = h.root.watch(
            |s| s.get("x"),
            |_, _, _| -> Result<(), CallbackError> { Err("listener broke".into()) },
        );
        let child = h.root.new_child(false);
        let _w2 = child.watch(
            |s| s.get("x"),
            move |_, _, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        h.root.apply(|s| s.set("x", 1)).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*h.errors.lock(), vec!["watch listener: listener broke".to_string()]);
    }

    #[test]
    fn failing_mutator_still_digests() {
        let h = harness();
        let (calls, calls_clone) = counter();
        let _w = h.root.watch(
            |s| s.get("x"),
            move |_, _, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        h.root
            .apply(|s| -> Result<(), CallbackError> {
                s.set("x", 1);
                Err("half done".into())
            })
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*h.errors.lock(), vec!["apply mutator: half done".to_string()]);
    }

    #[test]
    fn nested_apply_does_not_start_second_digest() {
        let h = harness();
        let (calls, calls_clone) = counter();

        let _w1 = h.root.watch(
            |s| s.get("trigger"),
            |_, _, s| {
                s.apply(|s| s.set("derived", "set inside listener")).unwrap();
            },
        );
        let _w2 = h.root.watch(
            |s| s.get("derived"),
            move |_, _, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        h.root.apply(|s| s.set("trigger", 1)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn digest_inside_digest_is_rejected() {
        let h = harness();
        let result = Arc::new(Mutex::new(None));

        let result_clone = result.clone();
        let _w = h.root.watch(
            |s| s.get("x"),
            move |_, _, s| {
                *result_clone.lock() = Some(s.digest().is_err());
            },
        );

        h.root.apply(|s| s.set("x", 1)).unwrap();
        assert_eq!(*result.lock(), Some(true));
    }

    #[test]
    fn digest_on_child_does_not_check_ancestors() {
        let h = harness();
        let child = h.root.new_child(false);
        let (root_calls, root_clone) = counter();
        let (child_calls, child_clone) = counter();

        let _w1 = h.root.watch(
            |s| s.get("x"),
            move |_, _, _| {
                root_clone.fetch_add(1, Ordering::SeqCst);
            },
        );
        let _w2 = child.watch(
            |s| s.get("x"),
            move |_, _, _| {
                child_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        h.root.set("x", 1);
        child.digest().unwrap();

        assert_eq!(root_calls.load(Ordering::SeqCst), 0);
        assert_eq!(child_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deep_watch_ignores_equal_replacement() {
        let h = harness();
        h.root.set("items", serde_json::json!([1, 2]));
        let (identity, identity_clone) = counter();
        let (deep, deep_clone) = counter();

        let _w1 = h.root.watch(
            |s| s.get("items"),
            move |_, _, _| {
                identity_clone.fetch_add(1, Ordering::SeqCst);
            },
        );
        let _w2 = h.root.watch_deep(
            |s| s.get("items"),
            move |_, _, _| {
                deep_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        h.root.apply(|s| s.set("items", serde_json::json!([1, 2]))).unwrap();
        assert_eq!(identity.load(Ordering::SeqCst), 1);
        assert_eq!(deep.load(Ordering::SeqCst), 0);

        h.root.apply(|s| s.set("items", serde_json::json!([1, 2, 3]))).unwrap();
        assert_eq!(identity.load(Ordering::SeqCst), 2);
        assert_eq!(deep.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_watch_deregisters_after_first_change() {
        let h = harness();
        let (calls, calls_clone) = counter();

        let _w = h.root.watch_with(
            |s| s.get("x"),
            move |_, _, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            },
            WatchOptions::default().once().fire_initial(),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        h.root.apply(|s| s.set("x", 1)).unwrap();
        h.root.apply(|s| s.set("x", 2)).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.root.watch_count(), 0);
    }

    #[test]
    fn watch_deregistered_mid_round_does_not_fire() {
        let h = harness();
        let (calls, calls_clone) = counter();
        let second: Arc<Mutex<Option<crate::scope::Deregistration>>> = Arc::new(Mutex::new(None));

        let second_clone = second.clone();
        let _w1 = h.root.watch(
            |s| s.get("x"),
            move |_, _, _| {
                if let Some(handle) = second_clone.lock().take() {
                    handle.deregister();
                }
            },
        );
        *second.lock() = Some(h.root.watch(
            |s| s.get("x"),
            move |_, _, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            },
        ));

        h.root.apply(|s| s.set("x", 1)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn scope_destroyed_mid_digest_stops_firing() {
        let h = harness();
        let doomed = h.root.new_child(false);
        let below = doomed.new_child(false);
        let (calls, calls_clone) = counter();

        let doomed_clone = doomed.clone();
        let _w1 = h.root.watch(
            |s| s.get("x"),
            move |_, _, _| doomed_clone.destroy(),
        );
        for scope in [&doomed, &below] {
            let calls = calls_clone.clone();
            let _w = scope.watch(
                |s| s.get("x"),
                move |_, _, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                },
            );
        }

        h.root.apply(|s| s.set("x", 1)).unwrap();
        h.root.apply(|s| s.set("x", 2)).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(below.is_destroyed());
    }

    #[test]
    fn deferred_tasks_run_before_rounds_in_fifo_order() {
        let h = harness();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_watch = order.clone();
        let _w = h.root.watch(
            |s| s.get("x"),
            move |_, _, _| order_watch.lock().push("listener"),
        );

        h.root
            .apply(|s| {
                let first = order.clone();
                let nested = order.clone();
                s.defer(move |s| {
                    first.lock().push("first");
                    s.defer(move |_| nested.lock().push("nested"));
                });
                let second = order.clone();
                s.defer(move |s| {
                    second.lock().push("second");
                    s.set("x", 1);
                });
            })
            .unwrap();

        assert_eq!(*order.lock(), vec!["first", "second", "nested", "listener"]);
        // Deferred inside apply: no extra digest was scheduled
        assert_eq!(h.scheduler.pending(), 0);
    }

    #[test]
    fn task_deferred_by_listener_runs_before_next_round() {
        let h = harness();
        let (calls, calls_clone) = counter();

        let _w1 = h.root.watch(
            |s| s.get("x"),
            |_, _, s| s.defer(|s| s.set("y", "from task")),
        );
        let _w2 = h.root.watch(
            |s| s.get("y"),
            move |_, _, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        h.root.apply(|s| s.set("x", 1)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.scheduler.pending(), 0);
    }

    #[test]
    fn defer_outside_apply_coalesces_into_one_digest() {
        let h = harness();
        let (digests, digests_clone) = counter();
        h.root.post_digest(move |_| {
            digests_clone.fetch_add(1, Ordering::SeqCst);
        });

        for i in 0..3 {
            h.root.defer(move |s| s.set(format!("k{i}"), i));
        }
        assert_eq!(h.scheduler.pending(), 1);

        h.scheduler.run_pending();
        assert_eq!(h.root.get("k2"), Value::from(2));
        assert_eq!(digests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scheduled_flush_is_noop_after_sync_digest() {
        let h = harness();
        let (runs, runs_clone) = counter();

        h.root.defer(move |_| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
        h.root.digest().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        h.scheduler.run_pending();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deferred_task_of_destroyed_scope_is_dropped() {
        let h = harness();
        let child = h.root.new_child(false);
        let (runs, runs_clone) = counter();

        child.defer(move |_| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });
        child.destroy();
        h.scheduler.run_pending();

        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_deferred_task_is_reported() {
        let h = harness();
        h.root.defer(|_| -> Result<(), CallbackError> { Err("task broke".into()) });
        h.root.digest().unwrap();
        assert_eq!(*h.errors.lock(), vec!["deferred task: task broke".to_string()]);
    }

    #[test]
    fn apply_async_batches_mutations() {
        let h = harness();
        let (calls, calls_clone) = counter();
        let _w = h.root.watch(
            |s| Value::from(s.get("a").is_truthy() && s.get("b").is_truthy()),
            move |_, _, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        h.root.apply_async(|s| s.set("a", true));
        h.root.apply_async(|s| s.set("b", true));
        assert_eq!(h.scheduler.pending(), 1);
        assert!(h.root.get("a").is_undefined());

        h.scheduler.run_pending();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn root_digest_flushes_apply_async_first() {
        let h = harness();
        h.root.apply_async(|s| s.set("a", 1));
        h.root.digest().unwrap();
        assert_eq!(h.root.get("a"), Value::from(1));

        // The scheduled flush finds nothing left to do
        h.scheduler.run_pending();
        assert_eq!(h.root.get("a"), Value::from(1));
    }

    #[test]
    fn post_digest_runs_once_after_settling() {
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        h.root.post_digest(move |s| seen_clone.lock().push(s.get("x")));

        h.root.apply(|s| s.set("x", 3)).unwrap();
        h.root.apply(|s| s.set("x", 4)).unwrap();

        assert_eq!(*seen.lock(), vec![Value::from(3)]);
    }

    #[test]
    fn post_digest_tasks_survive_unstable_digest() {
        let h = harness_with_ttl(3);
        let (runs, runs_clone) = counter();
        h.root.post_digest(move |_| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });

        let _w = h.root.watch(
            |s| s.get("n"),
            |new, _, s| {
                let n = new.as_i64().unwrap_or(0);
                if n < 5 {
                    s.set("n", n + 1);
                }
            },
        );

        assert!(h.root.apply(|s| s.set("n", 1)).is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // The next digest settles and picks up the kept task
        h.root.digest().unwrap();
        assert_eq!(h.root.get("n"), Value::from(5));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn apply_from_another_thread_waits_for_running_digest() {
        use std::sync::Barrier;
        use std::time::Duration;

        let h = harness();
        let barrier = Arc::new(Barrier::new(2));
        let order = Arc::new(Mutex::new(Vec::new()));

        let (barrier_clone, order_clone) = (barrier.clone(), order.clone());
        let _gate = h.root.watch(
            |s| s.get("gate"),
            move |_, _, _| {
                barrier_clone.wait();
                barrier_clone.wait();
                order_clone.lock().push("listener done");
            },
        );
        let (calls, calls_clone) = counter();
        let _w = h.root.watch(
            |s| s.get("x"),
            move |_, _, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        std::thread::scope(|threads| {
            let digesting = threads.spawn(|| h.root.apply(|s| s.set("gate", true)));
            barrier.wait();

            let applying = threads.spawn(|| {
                let result = h.root.apply(|s| s.set("x", 1));
                order.lock().push("apply returned");
                result
            });
            std::thread::sleep(Duration::from_millis(50));
            barrier.wait();

            digesting.join().unwrap().unwrap();
            applying.join().unwrap().unwrap();
        });

        assert_eq!(*order.lock(), vec!["listener done", "apply returned"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(h.errors.lock().is_empty());
    }

    #[test]
    fn defer_while_another_thread_digests_schedules_a_flush() {
        use std::sync::Barrier;

        let h = harness();
        let barrier = Arc::new(Barrier::new(2));

        let barrier_clone = barrier.clone();
        let _gate = h.root.watch(
            |s| s.get("gate"),
            move |_, _, _| {
                barrier_clone.wait();
                barrier_clone.wait();
            },
        );

        std::thread::scope(|threads| {
            let digesting = threads.spawn(|| h.root.apply(|s| s.set("gate", true)));
            barrier.wait();
            h.root.defer(|s| s.set("late", true));
            barrier.wait();
            digesting.join().unwrap().unwrap();
        });

        // Whether or not the running digest drained it, a flush is queued
        assert_eq!(h.scheduler.pending(), 1);
        h.scheduler.run_pending();
        assert_eq!(h.root.get("late"), Value::from(true));
    }

    #[test]
    fn apply_on_destroyed_scope_fails() {
        let h = harness();
        let child = h.root.new_child(false);
        child.destroy();
        assert!(matches!(child.apply(|_| {}), Err(ScopeError::Destroyed(_))));
        assert!(matches!(child.digest(), Err(ScopeError::Destroyed(_))));
    }

    #[test]
    fn watch_group_fires_once_per_change() {
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        let _w = h.root.watch_group(
            vec![
                Box::new(|s: &Scope| s.get("a")) as BoxedAccessor,
                Box::new(|s: &Scope| s.get("b")),
            ],
            move |new, _, _| seen_clone.lock().push(new.clone()),
        );

        h.root
            .apply(|s| {
                s.set("a", 1);
                s.set("b", 2);
            })
            .unwrap();

        assert_eq!(*seen.lock(), vec![Value::array([1, 2])]);
    }

    #[test]
    fn watch_collection_sees_element_changes() {
        let h = harness();
        let (calls, calls_clone) = counter();
        h.root.set("list", Value::array([1, 2]));

        let _w = h.root.watch_collection(
            |s| s.get("list"),
            move |_, _, _| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        h.root.apply(|s| s.set("list", Value::array([1, 2]))).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        h.root.apply(|s| s.set("list", Value::array([1, 3]))).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
