//! Canopy Core
//!
//! This crate provides the core runtime for the Canopy data-binding
//! framework. It implements:
//!
//! - A tree of scopes holding observable application state
//! - A dirty-checking digest that runs watch listeners until state settles
//! - Deferred queues that batch external mutations into one digest
//! - Events that travel up or down the scope tree
//! - A dependency injector that builds services by name
//!
//! Template compilation, routing and HTTP live in other crates and consume
//! this one through the scope and injector APIs.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `value`: The dynamic values stored on scopes and seen by listeners
//! - `config`: Scope tree configuration
//! - `scope`: Scopes, watches, the digest and the event bus
//! - `inject`: Providers, modules and the injector
//! - `app`: Bootstrap wiring the core services together
//!
//! # Example
//!
//! ```rust,ignore
//! use canopy_core::app::bootstrap;
//! use canopy_core::inject::Modules;
//!
//! let app = bootstrap(&Modules::new(), &[])?;
//! let child = app.root.new_child(false);
//!
//! // Watch a property inherited from the root
//! child.watch(
//!     |scope| scope.get("count"),
//!     |new, old, _| println!("count: {old:?} -> {new:?}"),
//! );
//!
//! // Mutate and propagate
//! app.root.apply(|root| root.set("count", 1))?;
//! // Listener runs once, prints: "count: undefined -> 1"
//! ```

pub mod value;
pub mod config;
pub mod scope;
pub mod inject;
pub mod app;

pub use app::{bootstrap, App};
pub use scope::Scope;
pub use value::Value;
