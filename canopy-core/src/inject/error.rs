//! Injector errors.

use thiserror::Error;

use crate::scope::CallbackError;

#[derive(Debug, Error)]
pub enum InjectError {
    /// Nothing is registered under `name`. `path` shows who asked for it.
    #[error("unknown dependency '{name}' (resolving {path})")]
    UnknownDependency { name: String, path: String },

    /// `name` was requested while it was already being resolved.
    #[error("circular dependency: {path}")]
    CircularDependency { path: String },

    #[error("'{0}' is already registered")]
    DuplicateRegistration(String),

    #[error("'{name}' does not hold a {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
    },

    /// A factory, constructor, provider or decorator failed.
    #[error("failed to construct '{name}': {source}")]
    Construction {
        name: String,
        #[source]
        source: CallbackError,
    },

    #[error("unknown module '{0}'")]
    UnknownModule(String),
}

pub type InjectResult<T> = std::result::Result<T, InjectError>;

/// Render a resolution path innermost first: `a <- b <- a`.
pub(crate) fn render_path<'a>(name: &str, stack: impl DoubleEndedIterator<Item = &'a str>) -> String {
    let mut path = String::from(name);
    for entry in stack.rev() {
        path.push_str(" <- ");
        path.push_str(entry);
    }
    path
}
