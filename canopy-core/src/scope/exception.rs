//! Exception Handling
//!
//! Watch listeners, deferred tasks, `apply` mutators and event listeners are
//! user code. A failure in one of them must not abort propagation for the
//! rest of the tree, so every call site catches the error at the smallest
//! granularity and hands it to the tree's `ExceptionHandler` together with a
//! short context string.

use std::fmt;
use std::sync::Arc;

/// Error type produced by user callbacks.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Return types accepted from user callbacks.
///
/// Callbacks may return `()` or `Result<(), E>` for any error convertible to
/// a [`CallbackError`].
pub trait CallbackOutput {
    fn into_result(self) -> Result<(), CallbackError>;
}

impl CallbackOutput for () {
    fn into_result(self) -> Result<(), CallbackError> {
        Ok(())
    }
}

impl<E> CallbackOutput for Result<(), E>
where
    E: Into<CallbackError>,
{
    fn into_result(self) -> Result<(), CallbackError> {
        self.map_err(Into::into)
    }
}

type HandlerFn = dyn Fn(&CallbackError, &str) + Send + Sync;

/// Sink for errors raised by user callbacks.
///
/// Registered in the injector as `$exceptionHandler`; decorate that name to
/// replace or wrap it.
#[derive(Clone)]
pub struct ExceptionHandler {
    inner: Arc<HandlerFn>,
}

impl ExceptionHandler {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&CallbackError, &str) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(handler),
        }
    }

    /// The default handler: log at error level and carry on.
    pub fn logging() -> Self {
        Self::new(|error, context| {
            tracing::error!(%error, context, "uncaught error in scope callback");
        })
    }

    pub fn handle(&self, error: &CallbackError, context: &str) {
        (self.inner)(error, context);
    }
}

impl Default for ExceptionHandler {
    fn default() -> Self {
        Self::logging()
    }
}

impl fmt::Debug for ExceptionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionHandler").finish_non_exhaustive()
    }
}
