//! Scope errors.

use thiserror::Error;

use super::listener::WatchId;
use super::node::ScopeId;
use super::phase::Phase;
use crate::value::Value;

/// A watch that changed during a digest round.
#[derive(Debug, Clone)]
pub struct WatchChange {
    pub scope: ScopeId,
    pub watch: WatchId,
    pub new_value: Value,
    pub old_value: Value,
}

#[derive(Debug, Error)]
pub enum ScopeError {
    /// The digest ran out of rounds. `changes` lists the watches that were
    /// still changing in the final round.
    #[error("{ttl} digest iterations reached without stabilizing; {} watch(es) still changing", .changes.len())]
    UnstableWatchers {
        ttl: usize,
        changes: Vec<WatchChange>,
    },

    #[error("{phase} already in progress")]
    DigestInProgress { phase: Phase },

    #[error("{0} has been destroyed")]
    Destroyed(ScopeId),
}

pub type ScopeResult<T> = std::result::Result<T, ScopeError>;
