//! # Synchronization Primitives
//!
//! Fiber-aware building blocks for sharing state between fibers.
//!
//! ## Primitives
//!
//! - [`Ref`] - A mutable cell updated atomically by effects
//! - [`Promise`] - A write-once variable that fibers can wait on
//! - [`Semaphore`] - A FIFO pool of permits
//!
//! ## Design Notes
//!
//! Waiting never blocks a worker thread. A fiber waiting on a promise or a
//! semaphore suspends on an async boundary and is resumed by whoever
//! completes the promise or releases the permits. Waits are interruptible;
//! an interrupted waiter removes itself from the wait queue.

use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::defect::Defect;
use crate::effect::{
    done, effect_async_interrupt, effect_total, succeed_erased, suspend, uninterruptible_mask,
    AsyncCallback, AsyncRegistration, Effect, Erased, InterruptStatusRestore, Never, Resume,
};
use crate::exit::Exit;
use crate::fiber::FiberId;
use crate::value::{Dynamic, Value};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

// ============================================================================
// Ref
// ============================================================================

/// A mutable cell shared between fibers.
///
/// Every operation is a single atomic step: `modify` and friends never
/// interleave with another fiber's update.
pub struct Ref<A> {
    id: u64,
    cell: Arc<Mutex<A>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<A: fmt::Debug> fmt::Debug for Ref<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref")
            .field("id", &self.id)
            .field("value", &*self.cell.lock())
            .finish()
    }
}

impl<A: Value> Ref<A> {
    /// Create a ref outside of any effect.
    pub fn new(initial: A) -> Self {
        Self {
            id: next_id(),
            cell: Arc::new(Mutex::new(initial)),
        }
    }

    /// Effect creating a fresh ref each time it runs.
    pub fn make<R: 'static, E: Value>(initial: A) -> Effect<R, E, Ref<A>> {
        effect_total(move || Ref::new(initial.clone()))
    }

    /// Get the ref ID for debugging.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Read the current value outside of any effect.
    pub fn unsafe_get(&self) -> A {
        self.cell.lock().clone()
    }

    /// Read the current value.
    pub fn get<R: 'static, E: Value>(&self) -> Effect<R, E, A> {
        let cell = Arc::clone(&self.cell);
        effect_total(move || cell.lock().clone())
    }

    /// Replace the current value.
    pub fn set<R: 'static, E: Value>(&self, value: A) -> Effect<R, E, ()> {
        let cell = Arc::clone(&self.cell);
        effect_total(move || *cell.lock() = value.clone())
    }

    /// Replace the current value, returning the previous one.
    pub fn get_and_set<R: 'static, E: Value>(&self, value: A) -> Effect<R, E, A> {
        self.modify(move |old| (old, value.clone()))
    }

    /// Atomically compute a result and a new value from the current one.
    pub fn modify<R: 'static, E: Value, B: Value, F>(&self, f: F) -> Effect<R, E, B>
    where
        F: Fn(A) -> (B, A) + Send + Sync + 'static,
    {
        let cell = Arc::clone(&self.cell);
        effect_total(move || {
            let mut guard = cell.lock();
            let (result, updated) = f(guard.clone());
            *guard = updated;
            result
        })
    }

    /// Atomically update the value.
    pub fn update<R: 'static, E: Value, F>(&self, f: F) -> Effect<R, E, ()>
    where
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.modify(move |a| ((), f(a)))
    }

    /// Atomically update the value and return the new one.
    pub fn update_and_get<R: 'static, E: Value, F>(&self, f: F) -> Effect<R, E, A>
    where
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.modify(move |a| {
            let updated = f(a);
            (updated.clone(), updated)
        })
    }

    /// Atomically update the value and return the previous one.
    pub fn get_and_update<R: 'static, E: Value, F>(&self, f: F) -> Effect<R, E, A>
    where
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.modify(move |a| (a.clone(), f(a)))
    }
}

// ============================================================================
// Promise
// ============================================================================

enum PromiseState {
    Pending {
        waiters: Vec<(u64, Resume)>,
        next_waiter: u64,
    },
    /// Completed with this effect; every waiter runs it.
    Done(Erased),
}

struct PromiseInner {
    id: u64,
    state: Mutex<PromiseState>,
}

impl PromiseInner {
    fn remove_waiter(&self, key: u64) {
        if let PromiseState::Pending { waiters, .. } = &mut *self.state.lock() {
            waiters.retain(|(waiter, _)| *waiter != key);
        }
    }
}

/// A variable that is completed exactly once and can be waited on by any
/// number of fibers.
///
/// Completion is first-wins: later attempts report `false` and leave the
/// stored result untouched.
pub struct Promise<E, A> {
    inner: Arc<PromiseInner>,
    _marker: PhantomData<fn() -> (E, A)>,
}

impl<E, A> Clone for Promise<E, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<E, A> fmt::Debug for Promise<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(&*self.inner.state.lock(), PromiseState::Done(_));
        f.debug_struct("Promise")
            .field("id", &self.inner.id)
            .field("done", &done)
            .finish()
    }
}

impl<E: Value, A: Value> Promise<E, A> {
    /// Create a promise outside of any effect.
    pub fn unsafe_make() -> Self {
        Self {
            inner: Arc::new(PromiseInner {
                id: next_id(),
                state: Mutex::new(PromiseState::Pending {
                    waiters: Vec::new(),
                    next_waiter: 0,
                }),
            }),
            _marker: PhantomData,
        }
    }

    /// Effect creating a fresh promise each time it runs.
    pub fn make<R: 'static, E2: Value>() -> Effect<R, E2, Promise<E, A>> {
        effect_total(Promise::unsafe_make)
    }

    /// Get the promise ID for debugging.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Suspend until the promise is completed, then continue with its
    /// result. Interrupting the wait unregisters the waiter.
    pub fn wait<R: 'static>(&self) -> Effect<R, E, A> {
        let inner = Arc::clone(&self.inner);
        effect_async_interrupt(move |callback: AsyncCallback<R, E, A>| {
            let mut state = inner.state.lock();
            match &mut *state {
                PromiseState::Done(effect) => {
                    AsyncRegistration::Ready(Effect::from_erased(Arc::clone(effect)))
                }
                PromiseState::Pending {
                    waiters,
                    next_waiter,
                } => {
                    let key = *next_waiter;
                    *next_waiter += 1;
                    waiters.push((key, callback.resume_fn()));
                    let inner = Arc::clone(&inner);
                    AsyncRegistration::Canceler(effect_total(move || inner.remove_waiter(key)))
                }
            }
        })
    }

    /// The result if the promise is already completed. Never suspends.
    pub fn poll<R: 'static, E2: Value>(&self) -> Effect<R, E2, Option<Effect<R, E, A>>> {
        let inner = Arc::clone(&self.inner);
        effect_total(move || match &*inner.state.lock() {
            PromiseState::Done(effect) => Some(Effect::from_erased(Arc::clone(effect))),
            PromiseState::Pending { .. } => None,
        })
    }

    /// Whether the promise has been completed.
    pub fn is_done<R: 'static, E2: Value>(&self) -> Effect<R, E2, bool> {
        let inner = Arc::clone(&self.inner);
        effect_total(move || matches!(&*inner.state.lock(), PromiseState::Done(_)))
    }

    /// Run `effect` and complete the promise with its exit.
    pub fn complete<R: 'static, E2: Value>(&self, effect: Effect<R, E, A>) -> Effect<R, E2, bool> {
        let this = self.clone();
        effect
            .result::<E2>()
            .chain(move |exit| this.done(exit))
    }

    /// Complete with a value.
    pub fn succeed<R: 'static, E2: Value>(&self, value: A) -> Effect<R, E2, bool> {
        self.done(Exit::Success(value))
    }

    /// Complete with a typed failure.
    pub fn fail<R: 'static, E2: Value>(&self, error: E) -> Effect<R, E2, bool> {
        self.halt(Cause::fail(error))
    }

    /// Complete with a cause.
    pub fn halt<R: 'static, E2: Value>(&self, cause: Cause<E>) -> Effect<R, E2, bool> {
        self.done(Exit::Failure(cause))
    }

    /// Complete with a defect.
    pub fn die<R: 'static, E2: Value>(&self, defect: Defect) -> Effect<R, E2, bool> {
        self.halt(Cause::die(defect))
    }

    /// Complete with an interruption on behalf of `fiber`.
    pub fn interrupt_as<R: 'static, E2: Value>(&self, fiber: FiberId) -> Effect<R, E2, bool> {
        self.halt(Cause::interrupt(fiber))
    }

    /// Complete with an exit.
    pub fn done<R: 'static, E2: Value>(&self, exit: Exit<E, A>) -> Effect<R, E2, bool> {
        let this = self.clone();
        effect_total(move || {
            this.unsafe_complete_with(done::<(), E, A>(exit.clone()).instr)
        })
    }

    /// Store `effect` as the result and resume every waiter with it.
    pub(crate) fn unsafe_complete_with(&self, effect: Erased) -> bool {
        let waiters = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                PromiseState::Done(_) => return false,
                PromiseState::Pending { waiters, .. } => {
                    let waiters = std::mem::take(waiters);
                    *state = PromiseState::Done(Arc::clone(&effect));
                    waiters
                }
            }
        };
        for (_, resume) in waiters {
            resume(Arc::clone(&effect));
        }
        true
    }
}

// ============================================================================
// Semaphore
// ============================================================================

struct Waiter {
    key: u64,
    permits: usize,
    granted: Arc<AtomicBool>,
    resume: Resume,
}

struct SemaphoreState {
    available: usize,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
}

/// A counting semaphore for fibers.
///
/// Waiters are served strictly in arrival order: a large request at the
/// head of the queue holds back smaller ones behind it.
#[derive(Clone)]
pub struct Semaphore {
    id: u64,
    state: Arc<Mutex<SemaphoreState>>,
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Semaphore")
            .field("id", &self.id)
            .field("available", &state.available)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl Semaphore {
    /// Create a semaphore with `permits` permits outside of any effect.
    pub fn new(permits: usize) -> Self {
        Self {
            id: next_id(),
            state: Arc::new(Mutex::new(SemaphoreState {
                available: permits,
                waiters: VecDeque::new(),
                next_waiter: 0,
            })),
        }
    }

    /// Effect creating a fresh semaphore each time it runs.
    pub fn make<R: 'static, E: Value>(permits: usize) -> Effect<R, E, Semaphore> {
        effect_total(move || Semaphore::new(permits))
    }

    /// Get the semaphore ID for debugging.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Permits not currently held.
    pub fn available_now(&self) -> usize {
        self.state.lock().available
    }

    /// Effect reading the permits not currently held.
    pub fn available<R: 'static, E: Value>(&self) -> Effect<R, E, usize> {
        let this = self.clone();
        effect_total(move || this.available_now())
    }

    /// Acquire one permit.
    pub fn acquire<R: 'static, E: Value>(&self) -> Effect<R, E, ()> {
        self.acquire_n(1)
    }

    /// Acquire `n` permits, suspending until they are available. If the wait
    /// is interrupted no permits are held afterwards.
    pub fn acquire_n<R: 'static, E: Value>(&self, n: usize) -> Effect<R, E, ()> {
        let this = self.clone();
        uninterruptible_mask(move |restore| this.acquire_with(n, restore))
    }

    /// Release one permit.
    pub fn release<R: 'static, E: Value>(&self) -> Effect<R, E, ()> {
        self.release_n(1)
    }

    /// Release `n` permits, waking waiters in arrival order.
    pub fn release_n<R: 'static, E: Value>(&self, n: usize) -> Effect<R, E, ()> {
        let this = self.clone();
        effect_total(move || this.release_now(n))
    }

    /// Run `effect` while holding one permit.
    pub fn with_permit<R: 'static, E: Value, A: Value>(
        &self,
        effect: Effect<R, E, A>,
    ) -> Effect<R, E, A> {
        self.with_permits(1, effect)
    }

    /// Run `effect` while holding `n` permits. The permits are released
    /// however the effect ends.
    pub fn with_permits<R: 'static, E: Value, A: Value>(
        &self,
        n: usize,
        effect: Effect<R, E, A>,
    ) -> Effect<R, E, A> {
        let this = self.clone();
        uninterruptible_mask(move |restore| {
            this.acquire_with(n, restore).zip_right(
                restore
                    .apply(effect.clone())
                    .ensuring(this.release_n::<R, Never>(n)),
            )
        })
    }

    /// Wait for `n` permits with the interrupt status `restore` captured.
    /// Must run in an uninterruptible region.
    fn acquire_with<R: 'static, E: Value>(
        &self,
        n: usize,
        restore: InterruptStatusRestore,
    ) -> Effect<R, E, ()> {
        let this = self.clone();
        suspend(move || {
            let granted = Arc::new(AtomicBool::new(false));
            let sem = this.clone();
            let held = Arc::clone(&granted);
            restore
                .apply(this.wait_for(n, granted))
                .on_interrupt(effect_total::<R, Never, (), _>(move || {
                    if held.swap(false, Ordering::AcqRel) {
                        sem.release_now(n);
                    }
                }))
        })
    }

    fn wait_for<R: 'static, E: Value>(
        &self,
        n: usize,
        granted: Arc<AtomicBool>,
    ) -> Effect<R, E, ()> {
        let shared = Arc::clone(&self.state);
        effect_async_interrupt(move |callback: AsyncCallback<R, E, ()>| {
            let mut state = shared.lock();
            if state.waiters.is_empty() && state.available >= n {
                state.available -= n;
                granted.store(true, Ordering::Release);
                return AsyncRegistration::Ready(Effect::from_erased(succeed_erased(
                    Dynamic::unit(),
                )));
            }
            let key = state.next_waiter;
            state.next_waiter += 1;
            state.waiters.push_back(Waiter {
                key,
                permits: n,
                granted: Arc::clone(&granted),
                resume: callback.resume_fn(),
            });
            let shared = Arc::clone(&shared);
            AsyncRegistration::Canceler(effect_total(move || {
                shared.lock().waiters.retain(|waiter| waiter.key != key);
            }))
        })
    }

    fn release_now(&self, n: usize) {
        let woken = {
            let mut state = self.state.lock();
            state.available += n;
            let mut woken = Vec::new();
            while let Some(waiter) = state.waiters.front() {
                if waiter.permits > state.available {
                    break;
                }
                let permits = waiter.permits;
                if let Some(waiter) = state.waiters.pop_front() {
                    state.available -= permits;
                    waiter.granted.store(true, Ordering::Release);
                    woken.push(waiter.resume);
                }
            }
            woken
        };
        for resume in woken {
            resume(succeed_erased(Dynamic::unit()));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ref_ids_are_unique() {
        let a = Ref::new(1);
        let b = Ref::new(1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_ref_unsafe_get() {
        let cell = Ref::new(String::from("start"));
        assert_eq!(cell.unsafe_get(), "start");
        assert!(format!("{:?}", cell).contains("start"));
    }

    #[test]
    fn test_promise_completes_once() {
        let promise = Promise::<String, u32>::unsafe_make();
        assert!(promise.unsafe_complete_with(succeed_erased(Dynamic::new(1u32))));
        assert!(!promise.unsafe_complete_with(succeed_erased(Dynamic::new(2u32))));
        assert!(format!("{:?}", promise).contains("done: true"));
    }

    #[test]
    fn test_promise_resumes_registered_waiters() {
        let promise = Promise::<String, u32>::unsafe_make();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            let resume: Resume = Arc::new(move |effect: Erased| seen.lock().push(effect.tag()));
            if let PromiseState::Pending { waiters, next_waiter } = &mut *promise.inner.state.lock() {
                waiters.push((*next_waiter, resume));
                *next_waiter += 1;
            }
        }
        promise.inner.remove_waiter(0);
        assert!(promise.unsafe_complete_with(succeed_erased(Dynamic::new(7u32))));
        assert_eq!(*seen.lock(), vec!["Succeed"]);
    }

    #[test]
    fn test_semaphore_release_serves_fifo() {
        let semaphore = Semaphore::new(0);
        let order = Arc::new(Mutex::new(Vec::new()));
        for (key, permits) in [(0u64, 2usize), (1, 1)] {
            let order = Arc::clone(&order);
            semaphore.state.lock().waiters.push_back(Waiter {
                key,
                permits,
                granted: Arc::new(AtomicBool::new(false)),
                resume: Arc::new(move |_: Erased| order.lock().push(key)),
            });
        }

        semaphore.release_now(1);
        assert!(order.lock().is_empty());
        assert_eq!(semaphore.available_now(), 1);

        semaphore.release_now(2);
        assert_eq!(*order.lock(), vec![0, 1]);
        assert_eq!(semaphore.available_now(), 0);
    }
}
