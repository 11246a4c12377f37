//! Defects
//!
//! A defect is an unexpected, untyped error: a panic in user code, a bug, or
//! anything the program did not plan to recover from. Defects travel in the
//! `Die` branch of a [`Cause`](crate::cause::Cause), separately from the
//! typed failures an effect declares.
//!
//! Panics raised while the driver runs user closures are caught here and
//! turned into a [`PanicError`] defect instead of tearing down the worker.

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;

/// An untyped error carried by `Cause::Die`.
///
/// Cheap to clone; equality compares rendered messages.
#[derive(Clone)]
pub struct Defect {
    inner: Arc<dyn Error + Send + Sync + 'static>,
}

/// A defect built from a plain message.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DefectMessage {
    message: String,
}

/// A panic caught while running user code.
#[derive(Debug, Clone, Error)]
#[error("panicked at '{message}'{}", thread_suffix(.thread_name))]
pub struct PanicError {
    /// Panic payload rendered as text.
    pub message: String,
    /// Name of the thread that panicked, if it had one.
    pub thread_name: Option<String>,
}

fn thread_suffix(thread: &Option<String>) -> String {
    match thread {
        Some(name) => format!(" on thread '{name}'"),
        None => String::new(),
    }
}

/// Error produced by squashing a cause that holds only interruptions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct InterruptedError {
    message: String,
}

impl InterruptedError {
    /// Create an interruption error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Default for InterruptedError {
    fn default() -> Self {
        Self::new("Interrupted")
    }
}

impl Defect {
    /// Wrap any error as a defect.
    pub fn new<E>(error: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(error),
        }
    }

    /// Build a defect from a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::new(DefectMessage {
            message: message.into(),
        })
    }

    /// Build a defect from a panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let thread_name = std::thread::current().name().map(str::to_string);
        Self::new(PanicError {
            message,
            thread_name,
        })
    }

    /// Borrow the underlying error.
    pub fn as_error(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.inner
    }

    /// Downcast to a concrete error type.
    pub fn downcast_ref<T: Error + 'static>(&self) -> Option<&T> {
        self.as_error().downcast_ref::<T>()
    }

    /// Whether this defect came from a caught panic.
    pub fn is_panic(&self) -> bool {
        self.downcast_ref::<PanicError>().is_some()
    }

    /// Whether this defect stands for an interruption.
    pub fn is_interruption(&self) -> bool {
        self.downcast_ref::<InterruptedError>().is_some()
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.inner, f)
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Defect").field(&self.inner.to_string()).finish()
    }
}

impl PartialEq for Defect {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.to_string() == other.to_string()
    }
}

impl Error for Defect {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.source()
    }
}

/// Run a closure, turning a panic into a [`Defect`].
pub fn catch_defect<F, R>(f: F) -> Result<R, Defect>
where
    F: FnOnce() -> R,
{
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(Defect::from_panic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk on fire")]
    struct DiskError;

    #[test]
    fn test_message_defect() {
        let defect = Defect::message("boom");
        assert_eq!(defect.to_string(), "boom");
        assert!(!defect.is_panic());
    }

    #[test]
    fn test_wraps_typed_error() {
        let defect = Defect::new(DiskError);
        assert!(defect.downcast_ref::<DiskError>().is_some());
        assert_eq!(defect.to_string(), "disk on fire");
    }

    #[test]
    fn test_catch_defect_ok() {
        assert_eq!(catch_defect(|| 5).unwrap(), 5);
    }

    #[test]
    fn test_catch_defect_panic() {
        let defect = catch_defect(|| -> i32 { panic!("kaboom") }).unwrap_err();
        assert!(defect.is_panic());
        assert!(defect.to_string().contains("kaboom"));
    }

    #[test]
    fn test_equality_by_message() {
        assert_eq!(Defect::message("x"), Defect::message("x"));
        assert_ne!(Defect::message("x"), Defect::message("y"));
    }

    #[test]
    fn test_interrupted_error() {
        let defect = Defect::new(InterruptedError::default());
        assert!(defect.is_interruption());
        assert_eq!(defect.to_string(), "Interrupted");
    }
}
