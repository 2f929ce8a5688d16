//! Dependency Injection
//!
//! This module implements the name-keyed container that builds services and
//! hands them to each other.
//!
//! # Overview
//!
//! Providers are registered under names, each with an explicit list of the
//! names it depends on. Resolving a name builds its dependencies first,
//! then the instance itself, then caches it. Every name resolves to at most
//! one instance per injector.
//!
//! # Design Decisions
//!
//! 1. Dependencies are declared, not inferred. A factory for `y` that needs
//!    `x` is registered as `factory("y", &["x"], ...)` and reads `x` back
//!    from its `Deps` by name and type.
//!
//! 2. Configuration and resolution are separate types. `InjectorBuilder`
//!    accepts and replaces registrations; `Injector` is sealed and only
//!    accepts new names.
//!
//! 3. The injector is an explicit value. Nothing is global, so several
//!    applications can live in one process.

mod error;
mod context;
mod provider;
mod injector;
mod module;

pub use error::{InjectError, InjectResult};
pub use provider::{Decorator, Deps, Instance, Locals, Provider, ProviderObject, ProviderResult, Recipe, ServiceProvider};
pub use injector::{Injector, InjectorBuilder, Registrar};
pub use module::{Module, Modules};
