//! Scope Configuration
//!
//! Tunables for a scope tree. They are fixed when the root scope is built,
//! either directly through `ScopeBuilder::config` or, in a bootstrapped
//! application, by configuring the `$rootScope` provider.

use serde::{Deserialize, Serialize};

/// Default number of rounds a digest may take before it is declared unstable.
pub const DEFAULT_DIGEST_TTL: usize = 10;

/// Smallest accepted digest TTL. One round to observe a change, one to
/// confirm that the listeners settled.
pub const MIN_DIGEST_TTL: usize = 2;

/// Configuration for a scope tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScopeConfig {
    /// Maximum number of rounds in one digest pass.
    pub digest_ttl: usize,
}

impl ScopeConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.normalized())
    }

    /// Return a copy with a digest TTL of at least `MIN_DIGEST_TTL`.
    pub fn normalized(mut self) -> Self {
        if self.digest_ttl < MIN_DIGEST_TTL {
            tracing::warn!(
                requested = self.digest_ttl,
                applied = MIN_DIGEST_TTL,
                "digest ttl below minimum"
            );
            self.digest_ttl = MIN_DIGEST_TTL;
        }
        self
    }
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            digest_ttl: DEFAULT_DIGEST_TTL,
        }
    }
}
