//! Application Bootstrap
//!
//! `bootstrap` builds an injector from a set of modules and creates the
//! root scope through it. The core module registers the services every
//! application has:
//!
//! - `$exceptionHandler`: the `ExceptionHandler` every scope callback error
//!   goes to. Decorate it to wrap or replace the default logging handler.
//! - `$scheduler`: the `Arc<dyn Scheduler>` that runs deferred digests.
//!   Defaults to Tokio inside a runtime and a manual queue outside one,
//!   which the host drains with `App::run_pending`.
//! - `$rootScope`: the root `Scope`, built by `RootScopeProvider` from the
//!   two services above. Its digest TTL is set during configuration through
//!   `$rootScopeProvider`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ScopeConfig;
use crate::inject::{Deps, InjectResult, Injector, Instance, Module, Modules, ProviderResult, Registrar, ServiceProvider};
use crate::scope::{default_scheduler, ExceptionHandler, Scheduler, Scope};

/// Name of the module every application loads first.
pub const CORE_MODULE: &str = "canopy";

pub const EXCEPTION_HANDLER: &str = "$exceptionHandler";
pub const SCHEDULER: &str = "$scheduler";
pub const ROOT_SCOPE: &str = "$rootScope";

/// Builds `$rootScope`.
#[derive(Debug, Default)]
pub struct RootScopeProvider {
    config: Mutex<ScopeConfig>,
}

impl RootScopeProvider {
    pub fn digest_ttl(&self, ttl: usize) {
        let mut config = self.config.lock();
        *config = ScopeConfig {
            digest_ttl: ttl,
        }
        .normalized();
    }

    pub fn configure(&self, config: ScopeConfig) {
        *self.config.lock() = config.normalized();
    }

    pub fn config(&self) -> ScopeConfig {
        self.config.lock().clone()
    }
}

impl ServiceProvider for RootScopeProvider {
    fn deps(&self) -> &[&str] {
        &[EXCEPTION_HANDLER, SCHEDULER]
    }

    fn get(&self, deps: &Deps) -> ProviderResult<Instance> {
        let handler = deps.get::<ExceptionHandler>(EXCEPTION_HANDLER)?;
        let scheduler = deps.get::<Arc<dyn Scheduler>>(SCHEDULER)?;

        let root = Scope::builder()
            .config(self.config())
            .scheduler(Arc::clone(&*scheduler))
            .exception_handler(ExceptionHandler::clone(&handler))
            .build();
        Ok(Arc::new(root))
    }
}

/// The module holding the core services.
pub fn core_module() -> Module {
    let mut module = Module::new(CORE_MODULE);
    module
        .value(EXCEPTION_HANDLER, ExceptionHandler::default())
        .factory(SCHEDULER, &[], |_| Ok(default_scheduler()))
        .provider(ROOT_SCOPE, RootScopeProvider::default());
    module
}

/// A bootstrapped application.
#[derive(Debug, Clone)]
pub struct App {
    pub injector: Injector,
    pub root: Scope,
}

impl App {
    /// Drain scheduled work the host has to drive. See
    /// [`Scope::run_scheduled`].
    pub fn run_pending(&self) -> usize {
        self.root.run_scheduled()
    }
}

/// Load the core module followed by `names` and create the root scope.
///
/// A module named like the core module in `modules` is used in its place.
pub fn bootstrap(modules: &Modules, names: &[&str]) -> InjectResult<App> {
    let mut modules = modules.clone();
    if !modules.contains(CORE_MODULE) {
        modules.add(core_module());
    }

    let mut requested = Vec::with_capacity(names.len() + 1);
    requested.push(CORE_MODULE);
    requested.extend_from_slice(names);

    let injector = modules.injector(&requested)?;
    let root = Scope::clone(&*injector.get::<Scope>(ROOT_SCOPE)?);

    tracing::debug!(scope = %root.id(), modules = names.len(), "application bootstrapped");
    Ok(App { injector, root })
}
