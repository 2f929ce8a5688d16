//! Modules
//!
//! A module is a named bundle of registrations. It may require other
//! modules, and it may carry config blocks, which run against the
//! `InjectorBuilder` while it is still open, and run blocks, which run
//! against the sealed `Injector`.
//!
//! Loading a list of module names visits each module once, depth first:
//! required modules are loaded before the module that requires them. Each
//! module's registrations are applied and its config blocks run as soon as
//! it is loaded. Run blocks are collected in the same order and run after
//! the injector is built.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use super::error::{InjectError, InjectResult};
use super::injector::{Injector, InjectorBuilder, Registrar};
use super::provider::{Decorator, Provider};

type ConfigBlock = Box<dyn Fn(&mut InjectorBuilder) -> InjectResult<()> + Send + Sync>;
type RunBlock = Box<dyn Fn(&Injector) -> InjectResult<()> + Send + Sync>;

pub struct Module {
    name: String,
    requires: Vec<String>,
    providers: Vec<(String, Provider)>,
    decorators: Vec<(String, Decorator)>,
    config_blocks: Vec<ConfigBlock>,
    run_blocks: Vec<RunBlock>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            requires: Vec::new(),
            providers: Vec::new(),
            decorators: Vec::new(),
            config_blocks: Vec::new(),
            run_blocks: Vec::new(),
        }
    }

    /// Name other modules use to require this one.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Load module `name` before this one.
    pub fn requires(&mut self, name: &str) -> &mut Self {
        self.requires.push(name.to_string());
        self
    }

    /// Run `block` against the open builder once this module's providers
    /// are registered.
    pub fn config<F>(&mut self, block: F) -> &mut Self
    where
        F: Fn(&mut InjectorBuilder) -> InjectResult<()> + Send + Sync + 'static,
    {
        self.config_blocks.push(Box::new(block));
        self
    }

    /// Run `block` after the injector is sealed.
    pub fn run<F>(&mut self, block: F) -> &mut Self
    where
        F: Fn(&Injector) -> InjectResult<()> + Send + Sync + 'static,
    {
        self.run_blocks.push(Box::new(block));
        self
    }
}

impl Registrar for Module {
    fn register(&mut self, name: &str, provider: Provider) -> &mut Self {
        self.providers.push((name.to_string(), provider));
        self
    }

    fn register_decorator(&mut self, name: &str, decorator: Decorator) -> &mut Self {
        self.decorators.push((name.to_string(), decorator));
        self
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("requires", &self.requires)
            .field("providers", &self.providers.len())
            .field("decorators", &self.decorators.len())
            .field("config_blocks", &self.config_blocks.len())
            .field("run_blocks", &self.run_blocks.len())
            .finish()
    }
}

/// Registry of modules by name.
#[derive(Clone, Default)]
pub struct Modules {
    modules: IndexMap<String, Arc<Module>>,
}

impl Modules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `module`, replacing any module with the same name.
    pub fn add(&mut self, module: Module) -> &mut Self {
        if self.modules.contains_key(module.name()) {
            tracing::warn!(module = module.name(), "module replaced");
        }
        self.modules.insert(module.name().to_string(), Arc::new(module));
        self
    }

    /// Whether a module named `name` was added.
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// The module named `name`, if added.
    pub fn get(&self, name: &str) -> Option<&Module> {
        self.modules.get(name).map(|module| module.as_ref())
    }

    /// Load `names` and their requirements into a new injector.
    pub fn injector(&self, names: &[&str]) -> InjectResult<Injector> {
        let mut builder = InjectorBuilder::new();
        let mut loader = Loader {
            modules: self,
            loaded: HashSet::new(),
            run_order: Vec::new(),
        };
        for name in names {
            loader.load(&mut builder, name)?;
        }

        let injector = builder.build();
        for module in &loader.run_order {
            for block in &module.run_blocks {
                block(&injector)?;
            }
        }

        tracing::debug!(modules = loader.run_order.len(), "modules loaded");
        Ok(injector)
    }
}

impl fmt::Debug for Modules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.modules.keys()).finish()
    }
}

struct Loader<'a> {
    modules: &'a Modules,
    loaded: HashSet<String>,
    run_order: Vec<Arc<Module>>,
}

impl Loader<'_> {
    fn load(&mut self, builder: &mut InjectorBuilder, name: &str) -> InjectResult<()> {
        if !self.loaded.insert(name.to_string()) {
            return Ok(());
        }
        let module = self
            .modules
            .modules
            .get(name)
            .cloned()
            .ok_or_else(|| InjectError::UnknownModule(name.to_string()))?;

        for required in &module.requires {
            self.load(builder, required)?;
        }

        for (name, provider) in &module.providers {
            builder.register(name, provider.clone());
        }
        for (name, decorator) in &module.decorators {
            builder.register_decorator(name, decorator.clone());
        }
        for block in &module.config_blocks {
            block(builder)?;
        }

        tracing::trace!(module = name, "module loaded");
        self.run_order.push(module);
        Ok(())
    }
}
