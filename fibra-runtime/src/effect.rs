//! # Effects
//!
//! An [`Effect<R, E, A>`] is an inert description of a computation that
//! reads an environment `R`, may fail with a typed error `E`, and succeeds
//! with an `A`. Nothing happens until a [`Runtime`](crate::runtime::Runtime)
//! hands the effect to a driver.
//!
//! Every combinator here is a constructor: it builds a new instruction node
//! around its inputs and returns immediately. Effects are cheap to clone and
//! can be run any number of times.
//!
//! ## Instruction set
//!
//! Internally an effect is a tree of [`Instr`] nodes over erased values
//! ([`Dynamic`]). The typed wrappers erase on the way in and downcast on the
//! way out; the type parameters on `Effect` keep the two sides in agreement.
//!
//! ## Example
//!
//! ```rust
//! use fibra_runtime::prelude::*;
//!
//! let runtime = Runtime::new(RuntimeConfig::default());
//! let program = fail::<(), String, usize>("boom".to_string())
//!     .catch_all::<Never, _>(|e| succeed(e.len()));
//! assert_eq!(runtime.run(program), Exit::succeed(4));
//! ```

use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::defect::Defect;
use crate::driver::typed_exit;
use crate::exit::Exit;
use crate::fiber::{Descriptor, FiberHandle, FiberId, InterruptStatus, RuntimeFiber};
use crate::fiber_ref::{ForkFn, JoinFn, RawFiberRef};
use crate::runtime::Platform;
use crate::scope::{FiberScope, Scope};
use crate::supervisor::Supervisor;
use crate::sync::Promise;
use crate::value::{Dynamic, Value};

/// The error type of effects that cannot fail.
pub type Never = Infallible;

pub(crate) type Erased = Arc<Instr>;
pub(crate) type Cont = Arc<dyn Fn(Dynamic) -> Erased + Send + Sync>;
pub(crate) type CauseCont = Arc<dyn Fn(Cause<Dynamic>) -> Erased + Send + Sync>;
pub(crate) type Resume = Arc<dyn Fn(Erased) + Send + Sync>;
pub(crate) type RaceCont = Arc<dyn Fn(Exit<Dynamic, Dynamic>, RuntimeFiber) -> Erased + Send + Sync>;

/// What an async registration asks the driver to do next.
pub(crate) enum Registration {
    /// Stay suspended until the callback fires.
    Pending,
    /// Continue right away with this effect.
    Ready(Erased),
    /// Stay suspended; run this effect if the fiber is interrupted first.
    Canceler(Erased),
}

/// One node of the instruction tree.
pub(crate) enum Instr {
    Succeed(Dynamic),
    Fail(Cause<Dynamic>),
    Total(Arc<dyn Fn() -> Dynamic + Send + Sync>),
    Partial(Arc<dyn Fn() -> Result<Dynamic, Dynamic> + Send + Sync>),
    Suspend(Arc<dyn Fn() -> Erased + Send + Sync>),
    Chain(Erased, Cont),
    Fold(Erased, CauseCont, Cont),
    Async {
        register: Arc<dyn Fn(Resume) -> Registration + Send + Sync>,
        blocking_on: Vec<FiberId>,
    },
    Fork {
        effect: Erased,
        scope: Option<FiberScope>,
        report: bool,
    },
    Race {
        left: Erased,
        right: Erased,
        left_wins: RaceCont,
        right_wins: RaceCont,
        scope: Option<FiberScope>,
    },
    InterruptStatus(Erased, InterruptStatus),
    CheckInterrupt(Arc<dyn Fn(InterruptStatus) -> Erased + Send + Sync>),
    Descriptor(Arc<dyn Fn(Descriptor) -> Erased + Send + Sync>),
    Supervise(Erased, Arc<dyn Supervisor>),
    NewFiberRef {
        initial: Dynamic,
        fork: ForkFn,
        join: JoinFn,
    },
    ModifyFiberRef(RawFiberRef, Arc<dyn Fn(Dynamic) -> (Dynamic, Dynamic) + Send + Sync>),
    GetForkScope(Arc<dyn Fn(FiberScope) -> Erased + Send + Sync>),
    OverrideForkScope(Erased, Option<FiberScope>),
    Yield,
    Access(Arc<dyn Fn(Dynamic) -> Erased + Send + Sync>),
    Provide(Dynamic, Erased),
    Platform(Arc<dyn Fn(&Platform) -> Erased + Send + Sync>),
}

impl Instr {
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Instr::Succeed(_) => "Succeed",
            Instr::Fail(_) => "Fail",
            Instr::Total(_) => "Total",
            Instr::Partial(_) => "Partial",
            Instr::Suspend(_) => "Suspend",
            Instr::Chain(..) => "Chain",
            Instr::Fold(..) => "Fold",
            Instr::Async { .. } => "Async",
            Instr::Fork { .. } => "Fork",
            Instr::Race { .. } => "Race",
            Instr::InterruptStatus(..) => "InterruptStatus",
            Instr::CheckInterrupt(_) => "CheckInterrupt",
            Instr::Descriptor(_) => "Descriptor",
            Instr::Supervise(..) => "Supervise",
            Instr::NewFiberRef { .. } => "NewFiberRef",
            Instr::ModifyFiberRef(..) => "ModifyFiberRef",
            Instr::GetForkScope(_) => "GetForkScope",
            Instr::OverrideForkScope(..) => "OverrideForkScope",
            Instr::Yield => "Yield",
            Instr::Access(_) => "Access",
            Instr::Provide(..) => "Provide",
            Instr::Platform(_) => "Platform",
        }
    }
}

pub(crate) fn succeed_erased(value: Dynamic) -> Erased {
    Arc::new(Instr::Succeed(value))
}

pub(crate) fn halt_erased(cause: Cause<Dynamic>) -> Erased {
    Arc::new(Instr::Fail(cause))
}

pub(crate) fn done_erased(exit: Exit<Dynamic, Dynamic>) -> Erased {
    match exit {
        Exit::Success(value) => succeed_erased(value),
        Exit::Failure(cause) => halt_erased(cause),
    }
}

pub(crate) fn chain_erased<F>(first: Erased, next: F) -> Erased
where
    F: Fn(Dynamic) -> Erased + Send + Sync + 'static,
{
    Arc::new(Instr::Chain(first, Arc::new(next)))
}

pub(crate) fn fold_erased<F, S>(effect: Erased, on_failure: F, on_success: S) -> Erased
where
    F: Fn(Cause<Dynamic>) -> Erased + Send + Sync + 'static,
    S: Fn(Dynamic) -> Erased + Send + Sync + 'static,
{
    Arc::new(Instr::Fold(effect, Arc::new(on_failure), Arc::new(on_success)))
}

pub(crate) fn async_erased<F>(register: F, blocking_on: Vec<FiberId>) -> Erased
where
    F: Fn(Resume) -> Registration + Send + Sync + 'static,
{
    Arc::new(Instr::Async {
        register: Arc::new(register),
        blocking_on,
    })
}

/// A description of a computation.
pub struct Effect<R, E, A> {
    pub(crate) instr: Erased,
    _marker: PhantomData<fn(R) -> (E, A)>,
}

impl<R, E, A> Clone for Effect<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            instr: Arc::clone(&self.instr),
            _marker: PhantomData,
        }
    }
}

impl<R, E, A> fmt::Debug for Effect<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Effect({})", self.instr.tag())
    }
}

/// Callback handed to async registrations; resumes the suspended fiber.
///
/// Only the first resumption counts. Later calls, and calls made after the
/// registration already returned an effect, are ignored.
pub struct AsyncCallback<R, E, A> {
    resume: Resume,
    _marker: PhantomData<fn(R) -> (E, A)>,
}

impl<R, E, A> Clone for AsyncCallback<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            resume: Arc::clone(&self.resume),
            _marker: PhantomData,
        }
    }
}

impl<R: 'static, E: Value, A: Value> AsyncCallback<R, E, A> {
    pub(crate) fn new(resume: Resume) -> Self {
        Self {
            resume,
            _marker: PhantomData,
        }
    }

    pub(crate) fn resume_fn(&self) -> Resume {
        Arc::clone(&self.resume)
    }

    /// Resume the fiber with `effect`.
    pub fn call(&self, effect: Effect<R, E, A>) {
        (self.resume)(effect.instr)
    }

    /// Resume the fiber with a value.
    pub fn succeed(&self, value: A) {
        self.call(succeed(value))
    }

    /// Resume the fiber with a typed failure.
    pub fn fail(&self, error: E) {
        self.call(fail(error))
    }

    /// Resume the fiber with a cause.
    pub fn halt(&self, cause: Cause<E>) {
        self.call(halt(cause))
    }

    /// Resume the fiber with an exit.
    pub fn done(&self, exit: Exit<E, A>) {
        self.call(done(exit))
    }
}

/// Result of an interruptible async registration.
pub enum AsyncRegistration<R, E, A> {
    /// Wait for the callback.
    Pending,
    /// The result is already known.
    Ready(Effect<R, E, A>),
    /// Wait for the callback; run the canceler if interrupted first.
    Canceler(Effect<R, Never, ()>),
}

/// Restores the interrupt status captured by
/// [`uninterruptible_mask`] or [`interruptible_mask`].
#[derive(Debug, Clone, Copy)]
pub struct InterruptStatusRestore(InterruptStatus);

impl InterruptStatusRestore {
    /// Run `effect` with the captured interrupt status.
    pub fn apply<R, E, A>(&self, effect: Effect<R, E, A>) -> Effect<R, E, A> {
        effect.interrupt_status(self.0)
    }

    /// The captured status.
    pub fn status(&self) -> InterruptStatus {
        self.0
    }
}

// ============================================================================
// Instruction-level combinators
// ============================================================================

impl<R, E, A> Effect<R, E, A> {
    pub(crate) fn from_instr(instr: Instr) -> Self {
        Self::from_erased(Arc::new(instr))
    }

    pub(crate) fn from_erased(instr: Erased) -> Self {
        Self {
            instr,
            _marker: PhantomData,
        }
    }

    /// Run this effect with the given interrupt status.
    pub fn interrupt_status(self, status: InterruptStatus) -> Self {
        Effect::from_instr(Instr::InterruptStatus(self.instr, status))
    }

    /// Let interruption take effect while this effect runs.
    pub fn interruptible(self) -> Self {
        self.interrupt_status(InterruptStatus::Interruptible)
    }

    /// Defer interruption until this effect completes.
    pub fn uninterruptible(self) -> Self {
        self.interrupt_status(InterruptStatus::Uninterruptible)
    }

    /// Attach `supervisor` to every fiber forked while this effect runs.
    pub fn supervised(self, supervisor: Arc<dyn Supervisor>) -> Self {
        Effect::from_instr(Instr::Supervise(self.instr, supervisor))
    }

    /// Attach fibers forked while this effect runs to `scope` instead of the
    /// current fiber. `None` restores the default.
    pub fn override_fork_scope(self, scope: Option<FiberScope>) -> Self {
        Effect::from_instr(Instr::OverrideForkScope(self.instr, scope))
    }

    /// Run this effect with `env` as its environment.
    pub fn provide_all<R0>(self, env: R) -> Effect<R0, E, A>
    where
        R: Value,
    {
        Effect::from_instr(Instr::Provide(Dynamic::new(env), self.instr))
    }
}

impl<R: 'static, E: Value, A: Value> Effect<R, E, A> {
    /// Sequence: run this effect, then the effect `f` builds from its value.
    pub fn chain<B: Value, F>(self, f: F) -> Effect<R, E, B>
    where
        F: Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    {
        Effect::from_erased(chain_erased(self.instr, move |value| {
            f(value.take::<A>()).instr
        }))
    }

    /// Transform the success value.
    pub fn map<B: Value, F>(self, f: F) -> Effect<R, E, B>
    where
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        self.chain(move |a| succeed(f(a)))
    }

    /// Replace the success value.
    pub fn as_<B: Value>(self, value: B) -> Effect<R, E, B> {
        self.map(move |_| value.clone())
    }

    /// Discard the success value.
    pub fn unit(self) -> Effect<R, E, ()> {
        self.as_(())
    }

    /// Run an effect built from the value, keeping the original value.
    pub fn tap<X: Value, F>(self, f: F) -> Effect<R, E, A>
    where
        F: Fn(A) -> Effect<R, E, X> + Send + Sync + 'static,
    {
        self.chain(move |a| f(a.clone()).as_(a))
    }

    /// Run both effects in sequence and combine their values.
    pub fn zip_with<B: Value, C: Value, F>(self, that: Effect<R, E, B>, f: F) -> Effect<R, E, C>
    where
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.chain(move |a| {
            let f = Arc::clone(&f);
            that.clone().map(move |b| f(a.clone(), b))
        })
    }

    /// Run both effects in sequence and pair their values.
    pub fn zip<B: Value>(self, that: Effect<R, E, B>) -> Effect<R, E, (A, B)> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Run both effects in sequence, keeping the first value.
    pub fn zip_left<B: Value>(self, that: Effect<R, E, B>) -> Effect<R, E, A> {
        self.zip_with(that, |a, _| a)
    }

    /// Run both effects in sequence, keeping the second value.
    pub fn zip_right<B: Value>(self, that: Effect<R, E, B>) -> Effect<R, E, B> {
        self.chain(move |_| that.clone())
    }

    /// Handle every outcome. Exactly one handler runs, and the failure
    /// handler sees the full cause.
    pub fn fold_cause_m<E2: Value, B: Value, F, S>(
        self,
        on_failure: F,
        on_success: S,
    ) -> Effect<R, E2, B>
    where
        F: Fn(Cause<E>) -> Effect<R, E2, B> + Send + Sync + 'static,
        S: Fn(A) -> Effect<R, E2, B> + Send + Sync + 'static,
    {
        Effect::from_erased(fold_erased(
            self.instr,
            move |cause| on_failure(cause.map(Dynamic::take::<E>)).instr,
            move |value| on_success(value.take::<A>()).instr,
        ))
    }

    /// Handle typed failures and successes. Defects and interruptions pass
    /// through untouched.
    pub fn fold_m<E2: Value, B: Value, F, S>(self, on_failure: F, on_success: S) -> Effect<R, E2, B>
    where
        F: Fn(E) -> Effect<R, E2, B> + Send + Sync + 'static,
        S: Fn(A) -> Effect<R, E2, B> + Send + Sync + 'static,
    {
        self.fold_cause_m(
            move |cause| match cause.failure_or_cause() {
                Ok(e) => on_failure(e),
                Err(cause) => halt(cause.widen()),
            },
            on_success,
        )
    }

    /// Fold typed failures and successes into a value.
    pub fn fold<E2: Value, B: Value, F, S>(self, on_failure: F, on_success: S) -> Effect<R, E2, B>
    where
        F: Fn(E) -> B + Send + Sync + 'static,
        S: Fn(A) -> B + Send + Sync + 'static,
    {
        self.fold_m(
            move |e| succeed(on_failure(e)),
            move |a| succeed(on_success(a)),
        )
    }

    /// Recover from typed failures.
    pub fn catch_all<E2: Value, F>(self, f: F) -> Effect<R, E2, A>
    where
        F: Fn(E) -> Effect<R, E2, A> + Send + Sync + 'static,
    {
        self.fold_m(f, |a| succeed(a))
    }

    /// Recover from any cause, including defects and interruption.
    pub fn catch_all_cause<E2: Value, F>(self, f: F) -> Effect<R, E2, A>
    where
        F: Fn(Cause<E>) -> Effect<R, E2, A> + Send + Sync + 'static,
    {
        self.fold_cause_m(f, |a| succeed(a))
    }

    /// Fall back to `that` on typed failure.
    pub fn or_else<E2: Value>(self, that: Effect<R, E2, A>) -> Effect<R, E2, A> {
        self.catch_all(move |_| that.clone())
    }

    /// Transform typed failures.
    pub fn map_error<E2: Value, F>(self, f: F) -> Effect<R, E2, A>
    where
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        self.map_error_cause(move |cause| cause.map(&f))
    }

    /// Transform the whole failure cause.
    pub fn map_error_cause<E2: Value, F>(self, f: F) -> Effect<R, E2, A>
    where
        F: Fn(Cause<E>) -> Cause<E2> + Send + Sync + 'static,
    {
        self.fold_cause_m(move |cause| halt(f(cause)), |a| succeed(a))
    }

    /// Transform both channels.
    pub fn bimap<E2: Value, B: Value, F, G>(self, f: F, g: G) -> Effect<R, E2, B>
    where
        F: Fn(E) -> E2 + Send + Sync + 'static,
        G: Fn(A) -> B + Send + Sync + 'static,
    {
        self.map_error(f).map(g)
    }

    /// Reify the outcome as an [`Exit`]. The resulting effect never fails.
    pub fn result<E2: Value>(self) -> Effect<R, E2, Exit<E, A>> {
        self.fold_cause_m(
            |cause| succeed(Exit::Failure(cause)),
            |a| succeed(Exit::Success(a)),
        )
    }

    /// Reify typed failures as a `Result`.
    pub fn either<E2: Value>(self) -> Effect<R, E2, Result<A, E>> {
        self.fold(Err, Ok)
    }

    /// Expose the full cause in the typed error channel.
    pub fn sandbox(self) -> Effect<R, Cause<E>, A> {
        self.fold_cause_m(|cause| fail(cause), |a| succeed(a))
    }

    /// Turn typed failures into defects.
    pub fn or_die_with<E2: Value, F>(self, f: F) -> Effect<R, E2, A>
    where
        F: Fn(E) -> Defect + Send + Sync + 'static,
    {
        self.catch_all(move |e| die(f(e)))
    }

    /// Collapse every failure into a single defect in the error channel.
    pub fn absorb_with<F>(self, f: F) -> Effect<R, Defect, A>
    where
        F: Fn(&E) -> Defect + Send + Sync + 'static,
    {
        self.sandbox().map_error(move |cause| cause.squash(&f))
    }

    /// Run `finalizer` after this effect, however it ends. The finalizer runs
    /// uninterruptibly; its own failure is appended to the effect's cause.
    pub fn ensuring<X: Value>(self, finalizer: Effect<R, Never, X>) -> Effect<R, E, A> {
        uninterruptible_mask(move |restore| {
            let on_failure = finalizer.clone();
            let on_success = finalizer.clone();
            restore.apply(self.clone()).fold_cause_m(
                move |cause: Cause<E>| {
                    let original = cause.clone();
                    on_failure.clone().fold_cause_m(
                        move |late: Cause<Never>| halt(cause.clone().then(late.widen())),
                        move |_| halt(original.clone()),
                    )
                },
                move |a| {
                    on_success.clone().fold_cause_m(
                        |late: Cause<Never>| halt(late.widen()),
                        move |_| succeed(a.clone()),
                    )
                },
            )
        })
    }

    /// Run `cleanup` if this effect is interrupted.
    pub fn on_interrupt<X: Value>(self, cleanup: Effect<R, Never, X>) -> Effect<R, E, A> {
        uninterruptible_mask(move |restore| {
            let cleanup = cleanup.clone();
            restore.apply(self.clone()).fold_cause_m(
                move |cause: Cause<E>| {
                    if !cause.interrupted() {
                        return halt(cause);
                    }
                    let original = cause.clone();
                    cleanup.clone().fold_cause_m(
                        move |late: Cause<Never>| halt(cause.clone().then(late.widen())),
                        move |_| halt(original.clone()),
                    )
                },
                |a| succeed(a),
            )
        })
    }

    /// Fork this effect into a child fiber attached to the current fork
    /// scope. Failures of the child that nobody observes are logged.
    pub fn fork<E2: Value>(self) -> Effect<R, E2, FiberHandle<E, A>> {
        self.fork_with(None, true)
    }

    /// Like [`fork`](Self::fork), for children whose failures the caller
    /// collects some other way.
    pub(crate) fn fork_unreported<E2: Value>(self) -> Effect<R, E2, FiberHandle<E, A>> {
        self.fork_with(None, false)
    }

    /// Fork this effect into a fiber that outlives the current one.
    pub fn fork_daemon<E2: Value>(self) -> Effect<R, E2, FiberHandle<E, A>> {
        self.fork_with(Some(Scope::Global), true)
    }

    /// Fork this effect into a fiber attached to `scope`.
    pub fn fork_in<E2: Value>(self, scope: FiberScope) -> Effect<R, E2, FiberHandle<E, A>> {
        self.fork_with(Some(scope), true)
    }

    fn fork_with<E2: Value>(
        self,
        scope: Option<FiberScope>,
        report: bool,
    ) -> Effect<R, E2, FiberHandle<E, A>> {
        Effect::<R, E2, RuntimeFiber>::from_instr(Instr::Fork {
            effect: self.instr,
            scope,
            report,
        })
        .map(|fiber: RuntimeFiber| fiber.cast::<E, A>())
    }

    /// Run both effects concurrently. The first to finish hands its exit and
    /// the other side's fiber to its handler, which decides the result.
    pub fn race_with<E2, B, E3, C, LW, RW>(
        self,
        that: Effect<R, E2, B>,
        left_wins: LW,
        right_wins: RW,
    ) -> Effect<R, E3, C>
    where
        E2: Value,
        B: Value,
        E3: Value,
        C: Value,
        LW: Fn(Exit<E, A>, FiberHandle<E2, B>) -> Effect<R, E3, C> + Send + Sync + 'static,
        RW: Fn(Exit<E2, B>, FiberHandle<E, A>) -> Effect<R, E3, C> + Send + Sync + 'static,
    {
        self.race_with_scope(that, left_wins, right_wins, None)
    }

    /// [`race_with`](Self::race_with), attaching both sides to `scope`.
    pub fn race_with_scope<E2, B, E3, C, LW, RW>(
        self,
        that: Effect<R, E2, B>,
        left_wins: LW,
        right_wins: RW,
        scope: Option<FiberScope>,
    ) -> Effect<R, E3, C>
    where
        E2: Value,
        B: Value,
        E3: Value,
        C: Value,
        LW: Fn(Exit<E, A>, FiberHandle<E2, B>) -> Effect<R, E3, C> + Send + Sync + 'static,
        RW: Fn(Exit<E2, B>, FiberHandle<E, A>) -> Effect<R, E3, C> + Send + Sync + 'static,
    {
        Effect::from_instr(Instr::Race {
            left: self.instr,
            right: that.instr,
            left_wins: Arc::new(move |exit, loser: RuntimeFiber| {
                left_wins(typed_exit::<E, A>(exit), loser.cast()).instr
            }),
            right_wins: Arc::new(move |exit, loser: RuntimeFiber| {
                right_wins(typed_exit::<E2, B>(exit), loser.cast()).instr
            }),
            scope,
        })
    }

    /// Run both effects concurrently and keep the first success. The loser
    /// is interrupted, and the race waits for it to finish. If the first
    /// effect to finish fails, the race waits for the other one; if both
    /// fail, the causes are combined in parallel.
    pub fn race(self, that: Effect<R, E, A>) -> Effect<R, E, A> {
        descriptor_with(move |descriptor| {
            let parent = descriptor.id;
            self.clone().race_with(
                that.clone(),
                move |exit, loser| settle_race(parent, exit, loser),
                move |exit, loser| settle_race(parent, exit, loser),
            )
        })
    }

    /// Run both effects concurrently and keep whichever finishes first,
    /// success or failure.
    pub fn race_first(self, that: Effect<R, E, A>) -> Effect<R, E, A> {
        self.result::<E>()
            .race(that.result())
            .chain(done)
    }

    /// Provide the environment once it has been computed by `layer`.
    pub fn provide_m<R0: 'static>(self, layer: Effect<R0, E, R>) -> Effect<R0, E, A>
    where
        R: Value,
    {
        layer.chain(move |env| self.clone().provide_all(env))
    }
}

fn settle_race<R: 'static, E: Value, A: Value>(
    parent: FiberId,
    exit: Exit<E, A>,
    loser: FiberHandle<E, A>,
) -> Effect<R, E, A> {
    match exit {
        Exit::Success(a) => loser.interrupt_as(parent).as_(a),
        Exit::Failure(cause) => loser
            .join()
            .map_error_cause(move |other| cause.clone().both(other)),
    }
}

impl<R: 'static, E: Value + std::error::Error, A: Value> Effect<R, E, A> {
    /// Turn typed failures into defects.
    pub fn or_die<E2: Value>(self) -> Effect<R, E2, A> {
        self.or_die_with(Defect::new)
    }

    /// Collapse every failure into a single defect.
    pub fn absorb(self) -> Effect<R, Defect, A> {
        self.absorb_with(|e: &E| Defect::new(e.clone()))
    }
}

impl<R: 'static, E: Value, A: Value> Effect<R, E, Effect<R, E, A>> {
    /// Run the inner effect.
    pub fn flatten(self) -> Effect<R, E, A> {
        self.chain(|inner| inner)
    }
}

// ============================================================================
// Constructors
// ============================================================================

/// Succeed with `value`.
pub fn succeed<R, E, A: Value>(value: A) -> Effect<R, E, A> {
    Effect::from_erased(succeed_erased(Dynamic::new(value)))
}

/// Succeed with `()`.
pub fn unit<R, E>() -> Effect<R, E, ()> {
    succeed(())
}

/// Fail with a typed error.
pub fn fail<R, E: Value, A>(error: E) -> Effect<R, E, A> {
    halt(Cause::fail(error))
}

/// Fail with a cause.
pub fn halt<R, E: Value, A>(cause: Cause<E>) -> Effect<R, E, A> {
    Effect::from_erased(halt_erased(cause.map(Dynamic::new)))
}

/// Fail with a defect.
pub fn die<R, E, A>(defect: Defect) -> Effect<R, E, A> {
    Effect::from_erased(halt_erased(Cause::die(defect)))
}

/// Fail with a defect built from a message.
pub fn die_message<R, E, A>(message: impl Into<String>) -> Effect<R, E, A> {
    die(Defect::message(message))
}

/// Complete with an exit.
pub fn done<R, E: Value, A: Value>(exit: Exit<E, A>) -> Effect<R, E, A> {
    match exit {
        Exit::Success(a) => succeed(a),
        Exit::Failure(cause) => halt(cause),
    }
}

/// Compute a value with a side-effecting thunk. A panic becomes a defect.
pub fn effect_total<R, E, A, F>(f: F) -> Effect<R, E, A>
where
    A: Value,
    F: Fn() -> A + Send + Sync + 'static,
{
    Effect::from_instr(Instr::Total(Arc::new(move || Dynamic::new(f()))))
}

/// Compute a value with a fallible thunk, mapping its error with `on_throw`.
pub fn try_catch<R, E, A, X, F, H>(f: F, on_throw: H) -> Effect<R, E, A>
where
    E: Value,
    A: Value,
    F: Fn() -> Result<A, X> + Send + Sync + 'static,
    H: Fn(X) -> E + Send + Sync + 'static,
{
    Effect::from_instr(Instr::Partial(Arc::new(move || match f() {
        Ok(a) => Ok(Dynamic::new(a)),
        Err(x) => Err(Dynamic::new(on_throw(x))),
    })))
}

/// Compute a value with a fallible thunk.
pub fn effect_partial<R, E, A, F>(f: F) -> Effect<R, E, A>
where
    E: Value,
    A: Value,
    F: Fn() -> Result<A, E> + Send + Sync + 'static,
{
    try_catch(f, |e| e)
}

/// Build the effect lazily, each time it runs.
pub fn suspend<R, E, A, F>(f: F) -> Effect<R, E, A>
where
    F: Fn() -> Effect<R, E, A> + Send + Sync + 'static,
{
    Effect::from_instr(Instr::Suspend(Arc::new(move || f().instr)))
}

/// Suspend until `register` resumes the fiber through its callback, or
/// continue right away if it returns `Some`.
pub fn effect_async_option<R, E, A, F>(register: F, blocking_on: Vec<FiberId>) -> Effect<R, E, A>
where
    R: 'static,
    E: Value,
    A: Value,
    F: Fn(AsyncCallback<R, E, A>) -> Option<Effect<R, E, A>> + Send + Sync + 'static,
{
    Effect::from_erased(async_erased(
        move |resume| match register(AsyncCallback::new(resume)) {
            Some(effect) => Registration::Ready(effect.instr),
            None => Registration::Pending,
        },
        blocking_on,
    ))
}

/// Suspend until `register` resumes the fiber through its callback.
pub fn effect_async<R, E, A, F>(register: F) -> Effect<R, E, A>
where
    R: 'static,
    E: Value,
    A: Value,
    F: Fn(AsyncCallback<R, E, A>) + Send + Sync + 'static,
{
    effect_async_option(
        move |callback| {
            register(callback);
            None
        },
        Vec::new(),
    )
}

/// Suspend with a canceler that runs if the fiber is interrupted while
/// waiting.
pub fn effect_async_interrupt<R, E, A, F>(register: F) -> Effect<R, E, A>
where
    R: 'static,
    E: Value,
    A: Value,
    F: Fn(AsyncCallback<R, E, A>) -> AsyncRegistration<R, E, A> + Send + Sync + 'static,
{
    Effect::from_erased(async_erased(
        move |resume| match register(AsyncCallback::new(resume)) {
            AsyncRegistration::Pending => Registration::Pending,
            AsyncRegistration::Ready(effect) => Registration::Ready(effect.instr),
            AsyncRegistration::Canceler(canceler) => Registration::Canceler(canceler.instr),
        },
        Vec::new(),
    ))
}

/// Suspend until the callback fires, where registration is itself an
/// effect. A failure of the registration effect fails the result.
pub fn effect_async_m<R, E, A, F>(register: F) -> Effect<R, E, A>
where
    R: 'static,
    E: Value,
    A: Value,
    F: Fn(AsyncCallback<R, E, A>) -> Effect<R, E, ()> + Send + Sync + 'static,
{
    let register = Arc::new(register);
    Promise::<E, A>::make().chain(move |promise| {
        let register = Arc::clone(&register);
        uninterruptible_mask(move |restore| {
            let target = promise.clone();
            let callback = AsyncCallback::new(Arc::new(move |effect: Erased| {
                target.unsafe_complete_with(effect);
            }));
            let on_error = promise.clone();
            register(callback)
                .catch_all_cause(move |cause| on_error.halt::<R, Never>(cause).unit())
                .fork::<E>()
                .zip_right(restore.apply(promise.wait()))
        })
    })
}

/// An effect that never completes. It can still be interrupted.
pub fn never<R: 'static, E: Value, A: Value>() -> Effect<R, E, A> {
    effect_async(|_: AsyncCallback<R, E, A>| {})
}

/// Hand the worker back to the scheduler and continue later.
pub fn yield_now<R, E>() -> Effect<R, E, ()> {
    Effect::from_instr(Instr::Yield)
}

/// Build an effect from the current interrupt status.
pub fn check_interruptible<R, E, A, F>(f: F) -> Effect<R, E, A>
where
    F: Fn(InterruptStatus) -> Effect<R, E, A> + Send + Sync + 'static,
{
    Effect::from_instr(Instr::CheckInterrupt(Arc::new(move |status| f(status).instr)))
}

/// Build an effect from a snapshot of the current fiber.
pub fn descriptor_with<R, E, A, F>(f: F) -> Effect<R, E, A>
where
    F: Fn(Descriptor) -> Effect<R, E, A> + Send + Sync + 'static,
{
    Effect::from_instr(Instr::Descriptor(Arc::new(move |d| f(d).instr)))
}

/// A snapshot of the current fiber.
pub fn descriptor<R, E>() -> Effect<R, E, Descriptor> {
    descriptor_with(|d| succeed(d))
}

/// The current fiber's id.
pub fn fiber_id<R, E>() -> Effect<R, E, FiberId> {
    descriptor_with(|d| succeed(d.id))
}

/// Interrupt the current fiber.
pub fn interrupt<R: 'static, E: Value, A: Value>() -> Effect<R, E, A> {
    fiber_id().chain(interrupt_as)
}

/// Fail with an interruption on behalf of `fiber`.
pub fn interrupt_as<R, E, A>(fiber: FiberId) -> Effect<R, E, A> {
    Effect::from_erased(halt_erased(Cause::interrupt(fiber)))
}

/// Run `f`'s effect uninterruptibly; `f` may restore the outer status for
/// parts of it.
pub fn uninterruptible_mask<R, E, A, F>(f: F) -> Effect<R, E, A>
where
    F: Fn(InterruptStatusRestore) -> Effect<R, E, A> + Send + Sync + 'static,
{
    check_interruptible(move |status| f(InterruptStatusRestore(status)).uninterruptible())
}

/// Run `f`'s effect interruptibly; `f` may restore the outer status for
/// parts of it.
pub fn interruptible_mask<R, E, A, F>(f: F) -> Effect<R, E, A>
where
    F: Fn(InterruptStatusRestore) -> Effect<R, E, A> + Send + Sync + 'static,
{
    check_interruptible(move |status| f(InterruptStatusRestore(status)).interruptible())
}

/// Build an effect from the scope new children would attach to.
pub fn fork_scope_with<R, E, A, F>(f: F) -> Effect<R, E, A>
where
    F: Fn(FiberScope) -> Effect<R, E, A> + Send + Sync + 'static,
{
    Effect::from_instr(Instr::GetForkScope(Arc::new(move |scope| f(scope).instr)))
}

/// The scope new children would attach to.
pub fn fork_scope<R, E>() -> Effect<R, E, FiberScope> {
    fork_scope_with(|scope| succeed(scope))
}

/// Acquire a resource, use it, and release it however the use ends.
/// Acquisition and release are uninterruptible.
pub fn bracket_exit<R, E, A, B, X, U, L>(
    acquire: Effect<R, E, A>,
    use_: U,
    release: L,
) -> Effect<R, E, B>
where
    R: 'static,
    E: Value,
    A: Value,
    B: Value,
    X: Value,
    U: Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    L: Fn(A, &Exit<E, B>) -> Effect<R, Never, X> + Send + Sync + 'static,
{
    let use_ = Arc::new(use_);
    let release = Arc::new(release);
    uninterruptible_mask(move |restore| {
        let use_ = Arc::clone(&use_);
        let release = Arc::clone(&release);
        acquire.clone().chain(move |a| {
            let release = Arc::clone(&release);
            restore
                .apply(use_(a.clone()))
                .result::<E>()
                .chain(move |exit| {
                    let settle = exit.clone();
                    release(a.clone(), &exit).fold_cause_m(
                        move |late: Cause<Never>| match settle.clone() {
                            Exit::Success(_) => halt(late.widen()),
                            Exit::Failure(cause) => halt(cause.then(late.widen())),
                        },
                        move |_| done(exit.clone()),
                    )
                })
        })
    })
}

/// Read the environment.
pub fn environment<R: Value, E>() -> Effect<R, E, R> {
    access_m(|env| succeed(env))
}

/// Compute a value from the environment.
pub fn access<R: Value, E, A: Value, F>(f: F) -> Effect<R, E, A>
where
    F: Fn(R) -> A + Send + Sync + 'static,
{
    access_m(move |env| succeed(f(env)))
}

/// Build an effect from the environment.
pub fn access_m<R: Value, E, A, F>(f: F) -> Effect<R, E, A>
where
    F: Fn(R) -> Effect<R, E, A> + Send + Sync + 'static,
{
    Effect::from_instr(Instr::Access(Arc::new(move |env: Dynamic| {
        f(env.take::<R>()).instr
    })))
}

/// Build an effect from the runtime platform.
pub(crate) fn with_platform<R, E, A, F>(f: F) -> Effect<R, E, A>
where
    F: Fn(&Platform) -> Effect<R, E, A> + Send + Sync + 'static,
{
    Effect::from_instr(Instr::Platform(Arc::new(move |platform| f(platform).instr)))
}

/// Run `f` on every item in order, collecting the values.
pub fn foreach<R, E, A, B, I, F>(items: I, f: F) -> Effect<R, E, Vec<B>>
where
    R: 'static,
    E: Value,
    A: Value,
    B: Value,
    I: IntoIterator<Item = A>,
    F: Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
{
    let items: Arc<Vec<A>> = Arc::new(items.into_iter().collect());
    let f = Arc::new(f);
    suspend(move || {
        let acc = Arc::new(Mutex::new(Vec::with_capacity(items.len())));
        foreach_step(Arc::clone(&items), 0, acc, Arc::clone(&f))
    })
}

fn foreach_step<R, E, A, B, F>(
    items: Arc<Vec<A>>,
    index: usize,
    acc: Arc<Mutex<Vec<B>>>,
    f: Arc<F>,
) -> Effect<R, E, Vec<B>>
where
    R: 'static,
    E: Value,
    A: Value,
    B: Value,
    F: Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
{
    let Some(item) = items.get(index).cloned() else {
        return effect_total(move || std::mem::take(&mut *acc.lock()));
    };
    f(item).chain(move |b| {
        acc.lock().push(b);
        foreach_step(Arc::clone(&items), index + 1, Arc::clone(&acc), Arc::clone(&f))
    })
}

/// Run `f` on every item in order, discarding the values.
pub fn foreach_unit<R, E, A, X, I, F>(items: I, f: F) -> Effect<R, E, ()>
where
    R: 'static,
    E: Value,
    A: Value,
    X: Value,
    I: IntoIterator<Item = A>,
    F: Fn(A) -> Effect<R, E, X> + Send + Sync + 'static,
{
    let items: Arc<Vec<A>> = Arc::new(items.into_iter().collect());
    foreach_unit_step(items, 0, Arc::new(f))
}

fn foreach_unit_step<R, E, A, X, F>(items: Arc<Vec<A>>, index: usize, f: Arc<F>) -> Effect<R, E, ()>
where
    R: 'static,
    E: Value,
    A: Value,
    X: Value,
    F: Fn(A) -> Effect<R, E, X> + Send + Sync + 'static,
{
    let Some(item) = items.get(index).cloned() else {
        return unit();
    };
    f(item).chain(move |_| foreach_unit_step(Arc::clone(&items), index + 1, Arc::clone(&f)))
}

/// Run every effect in order, collecting the values.
pub fn collect_all<R, E, A, I>(effects: I) -> Effect<R, E, Vec<A>>
where
    R: 'static,
    E: Value,
    A: Value,
    I: IntoIterator<Item = Effect<R, E, A>>,
{
    foreach(effects, |effect| effect)
}

/// Run `f` on every item concurrently, collecting the values in order. The
/// first failure, from whichever item fails first, interrupts the others
/// and becomes the result.
pub fn foreach_par<R, E, A, B, I, F>(items: I, f: F) -> Effect<R, E, Vec<B>>
where
    R: 'static,
    E: Value,
    A: Value,
    B: Value,
    I: IntoIterator<Item = A>,
    F: Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
{
    let items: Vec<A> = items.into_iter().collect();
    if items.is_empty() {
        return succeed(Vec::new());
    }
    let f = Arc::new(f);
    Promise::<E, ()>::make::<R, E>().chain(move |settled: Promise<E, ()>| {
        let remaining = Arc::new(AtomicUsize::new(items.len()));
        let f = Arc::clone(&f);
        let signal = settled.clone();
        let start = move |a: A| {
            let (on_fail, on_done, remaining) =
                (signal.clone(), signal.clone(), Arc::clone(&remaining));
            f(a).fold_cause_m(
                move |cause: Cause<E>| on_fail.halt::<R, E>(cause.clone()).zip_right(halt(cause)),
                move |b: B| {
                    let last = remaining.fetch_sub(1, Ordering::AcqRel) == 1;
                    let finish = if last { on_done.succeed::<R, E>(()) } else { succeed(true) };
                    finish.as_(b)
                },
            )
            .fork_unreported::<E>()
        };
        let settled = settled.clone();
        foreach(items.clone(), start).chain(move |fibers: Vec<FiberHandle<E, B>>| {
            let survivors = fibers.clone();
            settled
                .wait()
                .catch_all_cause(move |cause| {
                    foreach_unit(survivors.clone(), |fiber: FiberHandle<E, B>| {
                        fiber.interrupt::<R, E>()
                    })
                    .zip_right(halt(cause))
                })
                .zip_right(foreach(fibers, |fiber| fiber.join()))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_build_expected_instructions() {
        let ok: Effect<(), Never, i32> = succeed(1);
        assert_eq!(ok.instr.tag(), "Succeed");
        let failed: Effect<(), &str, i32> = fail("x");
        assert_eq!(failed.instr.tag(), "Fail");
        let chained = ok.clone().chain(|n| succeed(n + 1));
        assert_eq!(chained.instr.tag(), "Chain");
        assert_eq!(ok.clone().uninterruptible().instr.tag(), "InterruptStatus");
        assert_eq!(format!("{:?}", ok.fork::<Never>()), "Effect(Chain)");
    }

    #[test]
    fn test_effects_are_inert() {
        let counter = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&counter);
        let _effect: Effect<(), Never, ()> = effect_total(move || {
            *seen.lock() += 1;
        });
        assert_eq!(*counter.lock(), 0);
    }

    #[test]
    fn test_restore_keeps_status() {
        let restore = InterruptStatusRestore(InterruptStatus::Uninterruptible);
        assert_eq!(restore.status(), InterruptStatus::Uninterruptible);
    }
}
