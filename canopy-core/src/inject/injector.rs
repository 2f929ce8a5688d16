//! Injector
//!
//! An injector has two phases. While it is an `InjectorBuilder`, providers
//! and decorators can be registered, replaced and configured. `build` seals
//! it into an `Injector`, which creates instances lazily on first request
//! and caches each one for its own lifetime.
//!
//! # Resolution
//!
//! 1. A cached instance is returned as is.
//! 2. Otherwise the name is pushed on the resolution stack. A name that is
//!    already there is a cycle.
//! 3. The provider's declared dependencies are resolved, depth first, before
//!    its recipe runs. A cycle therefore fails before any constructor does.
//! 4. Decorators registered for the name wrap the result in order.
//! 5. The final instance is cached.
//!
//! No lock is held while recipes run, so recipes may resolve other names.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::context::{InjectorId, Resolution};
use super::error::{InjectError, InjectResult};
use super::provider::{downcast, Decorator, Deps, Instance, Locals, Provider, ProviderResult, ServiceProvider};

/// Registration surface shared by [`InjectorBuilder`] and `Module`.
pub trait Registrar {
    fn register(&mut self, name: &str, provider: Provider) -> &mut Self;

    fn register_decorator(&mut self, name: &str, decorator: Decorator) -> &mut Self;

    fn value<T: Any + Send + Sync>(&mut self, name: &str, value: T) -> &mut Self {
        self.register(name, Provider::value(value))
    }

    fn constant<T: Any + Send + Sync>(&mut self, name: &str, value: T) -> &mut Self {
        self.register(name, Provider::constant(value))
    }

    fn factory<T, F>(&mut self, name: &str, deps: &[&str], factory: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn(&Deps) -> ProviderResult<T> + Send + Sync + 'static,
    {
        self.register(name, Provider::factory(deps, factory))
    }

    fn service<T, F>(&mut self, name: &str, deps: &[&str], constructor: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn(&Deps) -> T + Send + Sync + 'static,
    {
        self.register(name, Provider::service(deps, constructor))
    }

    fn provider<P: ServiceProvider>(&mut self, name: &str, provider: P) -> &mut Self {
        self.register(name, Provider::object(provider))
    }

    fn decorator<T, F>(&mut self, name: &str, deps: &[&str], decorate: F) -> &mut Self
    where
        T: Any + Send + Sync,
        F: Fn(Arc<T>, &Deps) -> ProviderResult<T> + Send + Sync + 'static,
    {
        self.register_decorator(name, Decorator::new(deps, decorate))
    }
}

/// An injector in its configuration phase.
#[derive(Default)]
pub struct InjectorBuilder {
    providers: IndexMap<String, Provider>,
    decorators: HashMap<String, Vec<Decorator>>,
}

impl InjectorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// The provider object registered under `name`, for configuration.
    ///
    /// Accepts either the service name or the name with a `Provider`
    /// suffix, so `$rootScope` and `$rootScopeProvider` are equivalent.
    pub fn provider_object<P: ServiceProvider>(&self, name: &str) -> InjectResult<Arc<P>> {
        let key = if self.providers.contains_key(name) {
            name
        } else {
            name.strip_suffix("Provider").unwrap_or(name)
        };
        match self.providers.get(key) {
            Some(Provider::Object(object)) => downcast(name, object.object.clone()),
            Some(_) => Err(InjectError::TypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<P>(),
            }),
            None => Err(InjectError::UnknownDependency {
                name: name.to_string(),
                path: "configuration".to_string(),
            }),
        }
    }

    /// The constant registered under `name`. Only constants are readable
    /// before the injector is built.
    pub fn constant_value<T: Any + Send + Sync>(&self, name: &str) -> InjectResult<Arc<T>> {
        match self.providers.get(name) {
            Some(Provider::Constant(instance)) => downcast(name, instance.clone()),
            _ => Err(InjectError::UnknownDependency {
                name: name.to_string(),
                path: "configuration".to_string(),
            }),
        }
    }

    /// Seal the registrations.
    pub fn build(self) -> Injector {
        tracing::debug!(
            providers = self.providers.len(),
            decorated = self.decorators.len(),
            "injector sealed"
        );
        Injector {
            inner: Arc::new(Inner {
                id: InjectorId::new(),
                providers: Mutex::new(self.providers.into_iter().collect()),
                decorators: self.decorators,
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl Registrar for InjectorBuilder {
    fn register(&mut self, name: &str, provider: Provider) -> &mut Self {
        match self.providers.get(name) {
            Some(existing) if existing.is_constant() => {
                tracing::warn!(name, kind = provider.kind(), "constant cannot be replaced; registration ignored");
                return self;
            }
            Some(existing) => {
                tracing::warn!(
                    name,
                    previous = existing.kind(),
                    kind = provider.kind(),
                    "provider replaced"
                );
            }
            None => {
                tracing::debug!(name, kind = provider.kind(), "provider registered");
            }
        }
        self.providers.insert(name.to_string(), provider);
        self
    }

    fn register_decorator(&mut self, name: &str, decorator: Decorator) -> &mut Self {
        tracing::debug!(name, "decorator registered");
        self.decorators
            .entry(name.to_string())
            .or_default()
            .push(decorator);
        self
    }
}

impl fmt::Debug for InjectorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectorBuilder")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

struct Inner {
    id: InjectorId,
    providers: Mutex<HashMap<String, Provider>>,
    decorators: HashMap<String, Vec<Decorator>>,
    cache: Mutex<HashMap<String, Instance>>,
}

/// A sealed injector. Cloning yields another handle to the same injector.
#[derive(Clone)]
pub struct Injector {
    inner: Arc<Inner>,
}

impl Injector {
    /// Whether `name` can be resolved.
    pub fn has(&self, name: &str) -> bool {
        self.inner.cache.lock().contains_key(name) || self.inner.providers.lock().contains_key(name)
    }

    /// Register a provider after sealing. Names already in use are refused.
    pub fn register(&self, name: &str, provider: Provider) -> InjectResult<()> {
        let mut providers = self.inner.providers.lock();
        if providers.contains_key(name) {
            return Err(InjectError::DuplicateRegistration(name.to_string()));
        }
        tracing::debug!(name, kind = provider.kind(), "provider registered after sealing");
        providers.insert(name.to_string(), provider);
        Ok(())
    }

    /// The singleton instance for `name`.
    pub fn resolve(&self, name: &str) -> InjectResult<Instance> {
        if let Some(instance) = self.inner.cache.lock().get(name) {
            tracing::trace!(name, "cache hit");
            return Ok(instance.clone());
        }

        let provider = self.inner.providers.lock().get(name).cloned();
        let Some(provider) = provider else {
            return Err(InjectError::UnknownDependency {
                name: name.to_string(),
                path: Resolution::path(self.inner.id, name),
            });
        };

        let _resolution = Resolution::enter(self.inner.id, name)?;

        let mut instance = self.instantiate_provider(name, &provider)?;

        match self.inner.decorators.get(name) {
            Some(_) if provider.is_constant() => {
                tracing::warn!(name, "decorators on a constant are ignored");
            }
            Some(decorators) => {
                for decorator in decorators {
                    let deps = self.collect(&decorator.deps, None)?;
                    instance = (decorator.decorate)(instance, &deps).map_err(|source| {
                        InjectError::Construction {
                            name: name.to_string(),
                            source,
                        }
                    })?;
                }
            }
            None => {}
        }

        tracing::debug!(name, kind = provider.kind(), "instance created");

        let mut cache = self.inner.cache.lock();
        Ok(cache.entry(name.to_string()).or_insert(instance).clone())
    }

    /// The singleton instance for `name`, as a `T`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> InjectResult<Arc<T>> {
        downcast(name, self.resolve(name)?)
    }

    /// Call `f` with `deps` resolved. Names present in `locals` are taken
    /// from there instead of the registry.
    pub fn invoke<R>(&self, deps: &[&str], locals: &Locals, f: impl FnOnce(&Deps) -> R) -> InjectResult<R> {
        let names: Vec<String> = deps.iter().map(|name| name.to_string()).collect();
        let deps = self.collect(&names, Some(locals))?;
        Ok(f(&deps))
    }

    /// Construct a fresh, uncached `T` from its dependencies.
    pub fn instantiate<T, F>(&self, deps: &[&str], locals: &Locals, constructor: F) -> InjectResult<Arc<T>>
    where
        F: FnOnce(&Deps) -> T,
    {
        self.invoke(deps, locals, |deps| Arc::new(constructor(deps)))
    }

    fn instantiate_provider(&self, name: &str, provider: &Provider) -> InjectResult<Instance> {
        let built = match provider {
            Provider::Value(instance) | Provider::Constant(instance) => return Ok(instance.clone()),
            Provider::Factory(recipe) | Provider::Service(recipe) => {
                let deps = self.collect(&recipe.deps, None)?;
                (recipe.build)(&deps)
            }
            Provider::Object(object) => {
                let names: Vec<String> = object.provider.deps().iter().map(|d| d.to_string()).collect();
                let deps = self.collect(&names, None)?;
                object.provider.get(&deps)
            }
        };
        built.map_err(|source| InjectError::Construction {
            name: name.to_string(),
            source,
        })
    }

    fn collect(&self, names: &[String], locals: Option<&Locals>) -> InjectResult<Deps> {
        let mut deps = Deps::default();
        for name in names {
            let instance = match locals.and_then(|locals| locals.get(name)) {
                Some(local) => local.clone(),
                None => self.resolve(name)?,
            };
            deps.push(name, instance);
        }
        Ok(deps)
    }
}

impl fmt::Debug for Injector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Injector")
            .field("providers", &self.inner.providers.lock().len())
            .field("cached", &self.inner.cache.lock().len())
            .finish()
    }
}
