//! Tree Phase
//!
//! A scope tree is either idle, running an `apply` mutator, or running a
//! digest. The phase is shared by every scope in the tree and acts as the
//! re-entrancy guard: on the thread that owns the phase, a digest refuses to
//! start and `apply` falls back to running its mutator inline.
//!
//! # Threads
//!
//! The phase also serializes the tree across threads. A thread that finds a
//! phase owned by another thread blocks until it is released, so a job run
//! on a runtime worker and a caller on another thread never interleave
//! inside one digest.
//!
//! # Implementation
//!
//! Entering a phase returns a guard that clears it when dropped, so the
//! phase is released on every exit path, including early returns with
//! `?` and unwinding panics.

use std::fmt;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use super::error::{ScopeError, ScopeResult};

/// What the tree is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// An `apply` mutator is running.
    Apply,
    /// A digest pass is running.
    Digest,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Apply => f.write_str("apply"),
            Phase::Digest => f.write_str("digest"),
        }
    }
}

/// Shared phase slot for one tree.
#[derive(Debug, Default)]
pub(crate) struct PhaseCell {
    current: Mutex<Option<(Phase, ThreadId)>>,
    released: Condvar,
}

impl PhaseCell {
    /// The active phase, whichever thread owns it.
    pub(crate) fn current(&self) -> Option<Phase> {
        self.current.lock().map(|(phase, _)| phase)
    }

    /// The active phase if the calling thread owns it.
    pub(crate) fn held_here(&self) -> Option<Phase> {
        let me = thread::current().id();
        self.current
            .lock()
            .and_then(|(phase, owner)| (owner == me).then_some(phase))
    }

    /// Enter `phase`.
    ///
    /// Fails if the calling thread already owns a phase. Waits if another
    /// thread does.
    pub(crate) fn begin(&self, phase: Phase) -> ScopeResult<PhaseGuard<'_>> {
        let me = thread::current().id();
        let mut current = self.current.lock();
        loop {
            match *current {
                None => break,
                Some((active, owner)) if owner == me => {
                    return Err(ScopeError::DigestInProgress { phase: active });
                }
                Some(_) => self.released.wait(&mut current),
            }
        }
        *current = Some((phase, me));
        Ok(PhaseGuard { cell: self, phase })
    }
}

/// Guard that clears the phase when dropped.
pub(crate) struct PhaseGuard<'a> {
    cell: &'a PhaseCell,
    phase: Phase,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        let cleared = self.cell.current.lock().take().map(|(phase, _)| phase);
        self.cell.released.notify_all();

        debug_assert_eq!(
            cleared,
            Some(self.phase),
            "PhaseGuard mismatch: expected {:?}, found {:?}",
            self.phase,
            cleared
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_clears_phase() {
        let cell = PhaseCell::default();
        assert!(cell.current().is_none());

        {
            let _guard = cell.begin(Phase::Digest).unwrap();
            assert_eq!(cell.current(), Some(Phase::Digest));
        }

        assert!(cell.current().is_none());
    }

    #[test]
    fn nested_begin_is_rejected() {
        let cell = PhaseCell::default();
        let _guard = cell.begin(Phase::Apply).unwrap();

        let err = cell.begin(Phase::Digest).err().unwrap();
        assert!(matches!(
            err,
            ScopeError::DigestInProgress {
                phase: Phase::Apply
            }
        ));

        // The failed attempt must not clear the outer phase
        assert_eq!(cell.current(), Some(Phase::Apply));
    }

    #[test]
    fn guard_clears_phase_on_unwind() {
        let cell = PhaseCell::default();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = cell.begin(Phase::Digest).unwrap();
            panic!("listener blew up");
        }));

        assert!(result.is_err());
        assert!(cell.current().is_none());
    }

    #[test]
    fn held_here_ignores_other_threads() {
        let cell = PhaseCell::default();
        let _guard = cell.begin(Phase::Digest).unwrap();
        assert_eq!(cell.held_here(), Some(Phase::Digest));

        std::thread::scope(|s| {
            s.spawn(|| {
                assert_eq!(cell.held_here(), None);
                assert_eq!(cell.current(), Some(Phase::Digest));
            });
        });
    }

    #[test]
    fn other_thread_waits_for_release() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Duration;

        let cell = PhaseCell::default();
        let released = AtomicBool::new(false);
        let guard = cell.begin(Phase::Digest).unwrap();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                let _guard = cell.begin(Phase::Apply).unwrap();
                released.load(Ordering::SeqCst)
            });

            std::thread::sleep(Duration::from_millis(50));
            released.store(true, Ordering::SeqCst);
            drop(guard);

            // The waiter only got in after the owner let go
            assert!(waiter.join().unwrap());
        });
        assert!(cell.current().is_none());
    }
}
