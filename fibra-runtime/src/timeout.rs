//! Timeout Enforcement
//!
//! Timeouts race an effect against a timer on the runtime clock. When the
//! timer wins, the effect's fiber is interrupted and the race waits for its
//! finalizers before returning.
//!
//! # Components
//!
//! - [`Effect::timeout`]: `Some(value)` if the effect finished in time
//! - [`Effect::timeout_to`]: map both outcomes to a result
//! - [`Effect::timeout_fail`]: fail with a typed error on expiry
//! - [`Deadline`]: an absolute point in time, turned into a timeout with
//!   [`Effect::timeout_at`]
//! - [`Effect::timeout_expired`]: fail with a [`TimeoutError`]
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use fibra_runtime::prelude::*;
//!
//! let runtime = Runtime::new(RuntimeConfig::default());
//! let slow = never::<(), Never, u32>().timeout(Duration::from_millis(10));
//! assert_eq!(runtime.run(slow), Exit::succeed(None));
//! ```

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::clock::{now, sleep};
use crate::effect::{fail, succeed, Effect};
use crate::value::Value;

/// Failure for effects bounded with [`Effect::timeout_expired`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TimeoutError {
    /// The effect was still running when its time ran out.
    #[error("operation timed out after {duration:?}")]
    Expired {
        /// How long the effect was given.
        duration: Duration,
    },
}

/// An absolute point on the runtime clock.
///
/// Every effect bounded by the same deadline expires at the same instant,
/// however late it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    /// The deadline at `instant`.
    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    /// Effect reading the clock and returning the deadline `duration` from
    /// now.
    pub fn after<R: 'static, E: Value>(duration: Duration) -> Effect<R, E, Deadline> {
        now().map(move |instant| Deadline(instant + duration))
    }

    /// The instant this deadline falls on.
    pub fn instant(&self) -> Instant {
        self.0
    }

    /// Time left as seen from `now`, or `None` once it has passed.
    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        self.0
            .checked_duration_since(now)
            .filter(|left| !left.is_zero())
    }

    /// Effect reading the clock and checking whether the deadline passed.
    pub fn is_expired<R: 'static, E: Value>(&self) -> Effect<R, E, bool> {
        let this = *self;
        now().map(move |instant| this.remaining_at(instant).is_none())
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Self::at(instant)
    }
}

impl<R: 'static, E: Value, A: Value> Effect<R, E, A> {
    /// Succeed with `Some(value)` if this effect finishes within `duration`,
    /// otherwise interrupt it and succeed with `None`.
    pub fn timeout(self, duration: Duration) -> Effect<R, E, Option<A>> {
        self.timeout_to(None, Some, duration)
    }

    /// Like [`timeout`](Self::timeout), mapping the in-time value with `f` and
    /// returning `default` on expiry.
    pub fn timeout_to<B: Value, F>(self, default: B, f: F, duration: Duration) -> Effect<R, E, B>
    where
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        self.map(f)
            .race_first(sleep(duration).as_(default))
    }

    /// Fail with `on_timeout()` if this effect does not finish within
    /// `duration`.
    pub fn timeout_fail<F>(self, on_timeout: F, duration: Duration) -> Effect<R, E, A>
    where
        F: Fn() -> E + Send + Sync + 'static,
    {
        self.timeout(duration).chain(move |value| match value {
            Some(a) => succeed(a),
            None => fail(on_timeout()),
        })
    }

    /// Fail with [`TimeoutError::Expired`] if this effect does not finish
    /// within `duration`.
    pub fn timeout_expired(self, duration: Duration) -> Effect<R, E, A>
    where
        E: From<TimeoutError>,
    {
        self.timeout_fail(move || TimeoutError::Expired { duration }.into(), duration)
    }

    /// Like [`timeout`](Self::timeout), bounded by an absolute deadline. The
    /// time left is read from the runtime clock when the effect starts; a
    /// deadline already past interrupts the effect before it runs.
    pub fn timeout_at(self, deadline: Deadline) -> Effect<R, E, Option<A>> {
        now().chain(move |instant| match deadline.remaining_at(instant) {
            Some(left) => self.clone().timeout(left),
            None => succeed(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::effect::{never, Never};
    use crate::exit::Exit;
    use crate::runtime::Runtime;

    #[test]
    fn test_deadline_remaining() {
        let start = Instant::now();
        let deadline = Deadline::at(start + Duration::from_secs(60));
        assert_eq!(deadline.remaining_at(start), Some(Duration::from_secs(60)));
        assert_eq!(deadline.remaining_at(start + Duration::from_secs(60)), None);
        assert_eq!(deadline.remaining_at(start + Duration::from_secs(90)), None);
        assert!(Deadline::from(start) < deadline);
        assert_eq!(deadline.instant(), start + Duration::from_secs(60));
    }

    #[test]
    fn test_timeout_on_runtime() {
        let runtime = Runtime::new(RuntimeConfig::builder().num_workers(2).build_unchecked());

        let past = Deadline::at(Instant::now());
        let late = succeed::<(), Never, u8>(1).timeout_at(past);
        assert_eq!(runtime.run(late), Exit::succeed(None));

        let bounded = Deadline::after::<(), Never>(Duration::from_secs(30))
            .chain(|deadline| succeed(2u8).timeout_at(deadline));
        assert_eq!(runtime.run(bounded), Exit::succeed(Some(2)));

        let expired = Deadline::after::<(), Never>(Duration::ZERO)
            .chain(|deadline| deadline.is_expired());
        assert_eq!(runtime.run(expired), Exit::succeed(true));
    }

    #[test]
    fn test_timeout_expired_fails_with_error() {
        let runtime = Runtime::new(RuntimeConfig::builder().num_workers(2).build_unchecked());
        let d = Duration::from_millis(10);
        let exit = runtime.run(never::<(), TimeoutError, u8>().timeout_expired(d));
        assert_eq!(exit, Exit::fail(TimeoutError::Expired { duration: d }));
    }

    #[test]
    fn test_timeout_error_display() {
        let err = TimeoutError::Expired {
            duration: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "operation timed out after 250ms");
    }
}
