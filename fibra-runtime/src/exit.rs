//! Exit values
//!
//! An [`Exit`] is how a fiber finished: with a value, or with a [`Cause`].

use std::convert::Infallible;

use crate::cause::Cause;
use crate::defect::Defect;
use crate::fiber::FiberId;

/// The outcome of running an effect.
#[derive(Debug, Clone, PartialEq)]
pub enum Exit<E, A> {
    /// Completed with a value.
    Success(A),
    /// Failed with a cause.
    Failure(Cause<E>),
}

impl<E, A> Exit<E, A> {
    /// A successful exit.
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::fail(error))
    }

    /// A failure with an arbitrary cause.
    pub fn halt(cause: Cause<E>) -> Self {
        Exit::Failure(cause)
    }

    /// A defect.
    pub fn die(defect: Defect) -> Self {
        Exit::Failure(Cause::die(defect))
    }

    /// An interruption by `fiber`.
    pub fn interrupt(fiber: FiberId) -> Self {
        Exit::Failure(Cause::interrupt(fiber))
    }

    /// Whether the exit is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// Whether the exit is a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_))
    }

    /// Whether the exit failed because of an interruption.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Exit::Success(_) => false,
            Exit::Failure(cause) => cause.interrupted(),
        }
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }

    /// The failure cause, if any.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(cause) => Some(cause),
        }
    }

    /// The failure cause, or `Empty` for a success.
    pub fn into_cause(self) -> Cause<E> {
        match self {
            Exit::Success(_) => Cause::Empty,
            Exit::Failure(cause) => cause,
        }
    }

    /// Transform the success value.
    pub fn map<B, F>(self, f: F) -> Exit<E, B>
    where
        F: FnOnce(A) -> B,
    {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Transform every typed failure.
    pub fn map_err<E2, F>(self, f: F) -> Exit<E2, A>
    where
        F: FnMut(E) -> E2,
    {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(cause) => Exit::Failure(cause.map(f)),
        }
    }

    /// Transform the cause.
    pub fn map_cause<E2, F>(self, f: F) -> Exit<E2, A>
    where
        F: FnOnce(Cause<E>) -> Cause<E2>,
    {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(cause) => Exit::Failure(f(cause)),
        }
    }

    /// Combine two exits. Both successes are merged with `f`; failures are
    /// merged with `combine` (usually [`Cause::then`] or [`Cause::both`]).
    pub fn zip_with<B, C, F, G>(self, that: Exit<E, B>, f: F, combine: G) -> Exit<E, C>
    where
        F: FnOnce(A, B) -> C,
        G: FnOnce(Cause<E>, Cause<E>) -> Cause<E>,
    {
        match (self, that) {
            (Exit::Success(a), Exit::Success(b)) => Exit::Success(f(a, b)),
            (Exit::Failure(l), Exit::Success(_)) => Exit::Failure(l),
            (Exit::Success(_), Exit::Failure(r)) => Exit::Failure(r),
            (Exit::Failure(l), Exit::Failure(r)) => Exit::Failure(combine(l, r)),
        }
    }

    /// Append `cause` after this exit's own failure. A success stays a
    /// success only when `cause` is empty.
    pub fn then_cause(self, cause: Cause<E>) -> Self {
        if cause.is_empty() {
            return self;
        }
        match self {
            Exit::Success(_) => Exit::Failure(cause),
            Exit::Failure(own) => Exit::Failure(own.then(cause)),
        }
    }

    /// Convert into a `Result`, keeping the whole cause as the error.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(cause) => Err(cause),
        }
    }
}

impl<A> Exit<Infallible, A> {
    /// Reinterpret an exit that cannot fail with a typed error.
    pub fn widen<E>(self) -> Exit<E, A> {
        self.map_cause(|cause| cause.widen())
    }
}

impl<E, A> From<Result<A, E>> for Exit<E, A> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Exit::Success(a),
            Err(e) => Exit::fail(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        let ok: Exit<&str, i32> = Exit::succeed(1);
        assert!(ok.is_success());
        assert!(!ok.is_interrupted());

        let interrupted: Exit<&str, i32> = Exit::interrupt(FiberId::new(2));
        assert!(interrupted.is_failure());
        assert!(interrupted.is_interrupted());
    }

    #[test]
    fn test_map_and_map_err() {
        let ok: Exit<i32, i32> = Exit::succeed(2);
        assert_eq!(ok.map(|n| n + 1), Exit::succeed(3));

        let err: Exit<i32, i32> = Exit::fail(2);
        assert_eq!(err.map_err(|n| n.to_string()), Exit::fail("2".to_string()));
    }

    #[test]
    fn test_zip_with() {
        let a: Exit<&str, i32> = Exit::succeed(1);
        let b: Exit<&str, i32> = Exit::succeed(2);
        assert_eq!(a.zip_with(b, |x, y| x + y, Cause::then), Exit::succeed(3));

        let a: Exit<&str, i32> = Exit::fail("a");
        let b: Exit<&str, i32> = Exit::fail("b");
        assert_eq!(
            a.zip_with(b, |x, y| x + y, Cause::both),
            Exit::halt(Cause::fail("a").both(Cause::fail("b")))
        );
    }

    #[test]
    fn test_then_cause() {
        let ok: Exit<&str, i32> = Exit::succeed(1);
        assert_eq!(ok.clone().then_cause(Cause::empty()), Exit::succeed(1));
        assert_eq!(ok.then_cause(Cause::fail("late")), Exit::fail("late"));
    }

    #[test]
    fn test_from_result() {
        let exit: Exit<&str, i32> = Err("nope").into();
        assert_eq!(exit.into_result(), Err(Cause::fail("nope")));
    }
}
