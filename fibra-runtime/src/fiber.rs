//! # Fibers
//!
//! A fiber is one running effect: a lightweight thread of execution driven
//! by a [`Driver`](crate::driver::Driver) on the worker pool.
//!
//! ## Design
//!
//! - Fibers are M:N scheduled; a fiber hops between worker threads each time
//!   it suspends and resumes.
//! - Scheduling is cooperative: a fiber gives its worker up when it suspends
//!   on an async boundary, yields, or exhausts its operation budget.
//! - Every fiber is identified by a [`FiberId`], owns a scope that its
//!   children are attached to, and carries its own fiber-ref values.
//!
//! [`FiberHandle`] is the typed, user-facing view of a running fiber. All of
//! its operations are effects: awaiting, joining and interrupting a fiber only
//! happen when the returned effect is run.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::driver::{typed_exit, Driver};
use crate::effect::{descriptor_with, done, effect_total, foreach_unit, suspend, Effect};
use crate::exit::Exit;
use crate::fiber_ref::FiberRef;
use crate::scope::FiberScope;
use crate::value::{Dynamic, Value};

/// Unique identifier for a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(pub u64);

impl FiberId {
    /// Id used for interruptions that do not come from any fiber.
    pub const NONE: FiberId = FiberId(0);

    /// Create a new fiber ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.0)
    }
}

/// Global fiber ID counter.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique fiber ID.
pub fn next_fiber_id() -> FiberId {
    FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Whether a region of an effect may be interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InterruptStatus {
    /// Interruption takes effect at the next instruction boundary.
    #[default]
    Interruptible,
    /// Interruption is deferred until the region exits.
    Uninterruptible,
}

impl InterruptStatus {
    /// Build from a flag.
    pub fn from_bool(interruptible: bool) -> Self {
        if interruptible {
            InterruptStatus::Interruptible
        } else {
            InterruptStatus::Uninterruptible
        }
    }

    /// Whether interruption may take effect.
    pub fn is_interruptible(self) -> bool {
        self == InterruptStatus::Interruptible
    }
}

/// Observable execution status of a fiber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberStatus {
    /// Executing, or queued to execute, on a worker.
    Running {
        /// Whether the fiber is unwinding because of an interruption.
        interrupting: bool,
    },
    /// Waiting on an async boundary.
    Suspended {
        /// Whether an interruption would wake the fiber.
        interruptible: bool,
        /// Fibers this one is waiting on, if known.
        blocking_on: Vec<FiberId>,
    },
    /// Finished; the exit value is available.
    Done,
}

impl FiberStatus {
    /// Whether the fiber has finished.
    pub fn is_done(&self) -> bool {
        matches!(self, FiberStatus::Done)
    }

    /// Whether the fiber is unwinding because of an interruption.
    pub fn is_interrupting(&self) -> bool {
        matches!(self, FiberStatus::Running { interrupting: true })
    }
}

/// Snapshot of the current fiber, handed to
/// [`descriptor_with`](crate::effect::descriptor_with).
#[derive(Clone)]
pub struct Descriptor {
    /// The fiber's id.
    pub id: FiberId,
    /// Its status at the time of the snapshot.
    pub status: FiberStatus,
    /// Fibers that have asked to interrupt it.
    pub interruptors: Vec<FiberId>,
    /// The interrupt status of the current region.
    pub interrupt_status: InterruptStatus,
    /// The fiber's own scope, which its children attach to by default.
    pub scope: FiberScope,
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("interruptors", &self.interruptors)
            .field("interrupt_status", &self.interrupt_status)
            .finish_non_exhaustive()
    }
}

/// Typed handle to a running fiber.
pub struct FiberHandle<E, A> {
    driver: Arc<Driver>,
    _marker: PhantomData<fn() -> (E, A)>,
}

/// A fiber handle with erased types, as seen by supervisors.
pub type RuntimeFiber = FiberHandle<Dynamic, Dynamic>;

impl<E, A> Clone for FiberHandle<E, A> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            _marker: PhantomData,
        }
    }
}

impl<E, A> fmt::Debug for FiberHandle<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FiberHandle").field(&self.id()).finish()
    }
}

impl<E, A> FiberHandle<E, A> {
    pub(crate) fn from_driver(driver: Arc<Driver>) -> Self {
        Self {
            driver,
            _marker: PhantomData,
        }
    }

    /// The fiber's id.
    pub fn id(&self) -> FiberId {
        self.driver.id()
    }

    /// Forget the static types of this handle.
    pub fn erase(&self) -> RuntimeFiber {
        FiberHandle::from_driver(Arc::clone(&self.driver))
    }

    /// Reattach static types to a handle.
    pub(crate) fn cast<E2, A2>(self) -> FiberHandle<E2, A2> {
        FiberHandle::from_driver(self.driver)
    }
}

impl<E: Value, A: Value> FiberHandle<E, A> {
    /// Wait for the fiber to finish and return its exit.
    ///
    /// Never fails: the fiber's failure is returned inside the `Exit`.
    pub fn wait<R: 'static, E2: Value>(&self) -> Effect<R, E2, Exit<E, A>> {
        Effect::<R, E2, Exit<Dynamic, Dynamic>>::from_erased(self.driver.wait_erased())
            .map(typed_exit::<E, A>)
    }

    /// The fiber's exit, if it has already finished.
    pub fn poll<R: 'static, E2: Value>(&self) -> Effect<R, E2, Option<Exit<E, A>>> {
        let driver = Arc::clone(&self.driver);
        effect_total(move || driver.poll_exit().map(typed_exit::<E, A>))
    }

    /// Wait for the fiber, merge its fiber refs into the caller, and
    /// continue with its result.
    pub fn join<R: 'static>(&self) -> Effect<R, E, A> {
        let this = self.clone();
        self.wait().chain(move |exit| {
            this.inherit_refs()
                .chain(move |_| done(exit.clone()))
        })
    }

    /// Interrupt the fiber on behalf of `by` and wait for it to finish.
    ///
    /// Interrupting a finished fiber returns its original exit.
    pub fn interrupt_as<R: 'static, E2: Value>(&self, by: FiberId) -> Effect<R, E2, Exit<E, A>> {
        Effect::<R, E2, Exit<Dynamic, Dynamic>>::from_erased(self.driver.interrupt_as_erased(by))
            .map(typed_exit::<E, A>)
    }

    /// Interrupt the fiber on behalf of the calling fiber.
    pub fn interrupt<R: 'static, E2: Value>(&self) -> Effect<R, E2, Exit<E, A>> {
        let this = self.clone();
        descriptor_with(move |d| this.interrupt_as(d.id))
    }

    /// Read the fiber's current value of `fiber_ref`.
    pub fn get_ref<R: 'static, E2: Value, B: Value>(
        &self,
        fiber_ref: &FiberRef<B>,
    ) -> Effect<R, E2, B> {
        let driver = Arc::clone(&self.driver);
        let raw = fiber_ref.raw().clone();
        effect_total(move || driver.fiber_ref_value(&raw).take::<B>())
    }

    /// Merge the fiber's fiber-ref values into the calling fiber, using each
    /// ref's join function.
    pub fn inherit_refs<R: 'static, E2: Value>(&self) -> Effect<R, E2, ()> {
        let driver = Arc::clone(&self.driver);
        suspend(move || {
            foreach_unit(driver.fiber_ref_snapshot(), |(raw, child)| {
                Effect::<R, E2, ()>::from_erased(raw.join_into(child))
            })
        })
    }

    /// The fiber's current status.
    pub fn status<R: 'static, E2: Value>(&self) -> Effect<R, E2, FiberStatus> {
        let driver = Arc::clone(&self.driver);
        effect_total(move || driver.status())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_id_generation() {
        let id1 = next_fiber_id();
        let id2 = next_fiber_id();
        assert_ne!(id1, id2);
        assert!(id2.0 > id1.0);
        assert!(id1 > FiberId::NONE);
    }

    #[test]
    fn test_fiber_id_display() {
        assert_eq!(FiberId::new(12).to_string(), "Fiber(12)");
    }

    #[test]
    fn test_interrupt_status_default() {
        assert_eq!(InterruptStatus::default(), InterruptStatus::Interruptible);
        assert!(InterruptStatus::from_bool(true).is_interruptible());
        assert!(!InterruptStatus::from_bool(false).is_interruptible());
    }

    #[test]
    fn test_status_predicates() {
        assert!(FiberStatus::Done.is_done());
        assert!(FiberStatus::Running { interrupting: true }.is_interrupting());
        let suspended = FiberStatus::Suspended {
            interruptible: true,
            blocking_on: vec![FiberId::new(1)],
        };
        assert!(!suspended.is_done());
        assert!(!suspended.is_interrupting());
    }
}
