//! Provider Recipes
//!
//! A provider describes how to produce the instance registered under a
//! name. The kinds form a closed set:
//!
//! - `Value` hands out a ready-made instance.
//! - `Constant` is a value that is also readable while modules are being
//!   configured. It cannot be replaced or decorated.
//! - `Factory` calls a function with its resolved dependencies.
//! - `Service` calls a constructor with its resolved dependencies.
//! - `Object` delegates to a [`ServiceProvider`], an object that can be
//!   configured before the injector is sealed and builds the instance later.
//!
//! Dependencies are declared as explicit name lists and delivered to the
//! recipe as [`Deps`].

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use super::error::{InjectError, InjectResult};
use crate::scope::CallbackError;

/// A resolved instance.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Result type for user-supplied recipes.
pub type ProviderResult<T> = Result<T, CallbackError>;

type Build = Arc<dyn Fn(&Deps) -> ProviderResult<Instance> + Send + Sync>;
type Decorate = Arc<dyn Fn(Instance, &Deps) -> ProviderResult<Instance> + Send + Sync>;

/// An object that builds an instance and may be configured first.
///
/// Register one with `Registrar::provider`. During configuration it can be
/// fetched with `InjectorBuilder::provider_object`.
pub trait ServiceProvider: Any + Send + Sync {
    /// Names to resolve and pass to [`ServiceProvider::get`].
    fn deps(&self) -> &[&str] {
        &[]
    }

    fn get(&self, deps: &Deps) -> ProviderResult<Instance>;
}

/// A function plus the names of its dependencies.
#[derive(Clone)]
pub struct Recipe {
    pub(crate) deps: Vec<String>,
    pub(crate) build: Build,
}

impl fmt::Debug for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipe").field("deps", &self.deps).finish()
    }
}

/// A registered provider object, kept both as a provider and as `Any` so
/// that its configuration surface can be reached by type.
#[derive(Clone)]
pub struct ProviderObject {
    pub(crate) provider: Arc<dyn ServiceProvider>,
    pub(crate) object: Instance,
}

#[derive(Clone)]
pub enum Provider {
    Value(Instance),
    Constant(Instance),
    Factory(Recipe),
    Service(Recipe),
    Object(ProviderObject),
}

impl Provider {
    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Provider::Value(Arc::new(value))
    }

    pub fn constant<T: Any + Send + Sync>(value: T) -> Self {
        Provider::Constant(Arc::new(value))
    }

    pub fn factory<T, F>(deps: &[&str], factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&Deps) -> ProviderResult<T> + Send + Sync + 'static,
    {
        Provider::Factory(Recipe {
            deps: to_names(deps),
            build: Arc::new(move |deps: &Deps| {
                factory(deps).map(|value| Arc::new(value) as Instance)
            }),
        })
    }

    pub fn service<T, F>(deps: &[&str], constructor: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&Deps) -> T + Send + Sync + 'static,
    {
        Provider::Service(Recipe {
            deps: to_names(deps),
            build: Arc::new(move |deps: &Deps| -> ProviderResult<Instance> {
                Ok(Arc::new(constructor(deps)) as Instance)
            }),
        })
    }

    pub fn object<P: ServiceProvider>(provider: P) -> Self {
        let provider = Arc::new(provider);
        Provider::Object(ProviderObject {
            provider: provider.clone(),
            object: provider,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Provider::Value(_) => "value",
            Provider::Constant(_) => "constant",
            Provider::Factory(_) => "factory",
            Provider::Service(_) => "service",
            Provider::Object(_) => "provider",
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Provider::Constant(_))
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Factory(recipe) | Provider::Service(recipe) => f
                .debug_struct("Provider")
                .field("kind", &self.kind())
                .field("deps", &recipe.deps)
                .finish(),
            _ => f.debug_struct("Provider").field("kind", &self.kind()).finish(),
        }
    }
}

/// Wraps the instance produced for a name. Decorators for one name run in
/// registration order, each receiving the previous result.
#[derive(Clone)]
pub struct Decorator {
    pub(crate) deps: Vec<String>,
    pub(crate) decorate: Decorate,
}

impl Decorator {
    pub fn new<T, F>(deps: &[&str], decorate: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(Arc<T>, &Deps) -> ProviderResult<T> + Send + Sync + 'static,
    {
        Self {
            deps: to_names(deps),
            decorate: Arc::new(move |instance: Instance, deps: &Deps| -> ProviderResult<Instance> {
                let previous = instance.downcast::<T>().map_err(|_| InjectError::TypeMismatch {
                    name: "decorated instance".to_string(),
                    expected: type_name::<T>(),
                })?;
                decorate(previous, deps).map(|value| Arc::new(value) as Instance)
            }),
        }
    }
}

impl fmt::Debug for Decorator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decorator").field("deps", &self.deps).finish()
    }
}

/// Resolved dependencies, in the order they were declared.
#[derive(Clone, Default)]
pub struct Deps {
    entries: SmallVec<[(String, Instance); 4]>,
}

impl Deps {
    pub(crate) fn push(&mut self, name: &str, instance: Instance) {
        self.entries.push((name.to_string(), instance));
    }

    /// The instance resolved for `name`.
    pub fn instance(&self, name: &str) -> InjectResult<&Instance> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, instance)| instance)
            .ok_or_else(|| InjectError::UnknownDependency {
                name: name.to_string(),
                path: "declared dependencies".to_string(),
            })
    }

    /// The instance resolved for `name`, as a `T`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> InjectResult<Arc<T>> {
        downcast(name, self.instance(name)?.clone())
    }

    /// A copy of the `T` resolved for `name`.
    pub fn cloned<T: Any + Send + Sync + Clone>(&self, name: &str) -> InjectResult<T> {
        self.get::<T>(name).map(|value| (*value).clone())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Deps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Per-call values that take priority over registered ones in
/// `Injector::invoke`.
#[derive(Clone, Default)]
pub struct Locals {
    values: HashMap<String, Instance>,
}

impl Locals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Any + Send + Sync>(mut self, name: &str, value: T) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, name: &str, value: T) {
        self.values.insert(name.to_string(), Arc::new(value));
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Instance> {
        self.values.get(name)
    }
}

impl fmt::Debug for Locals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

pub(crate) fn downcast<T: Any + Send + Sync>(name: &str, instance: Instance) -> InjectResult<Arc<T>> {
    instance.downcast::<T>().map_err(|_| InjectError::TypeMismatch {
        name: name.to_string(),
        expected: type_name::<T>(),
    })
}

fn to_names(deps: &[&str]) -> Vec<String> {
    deps.iter().map(|name| name.to_string()).collect()
}
