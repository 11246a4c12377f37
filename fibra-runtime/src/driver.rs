//! # Fiber Driver
//!
//! The interpreter behind every fiber. A [`Driver`] owns one fiber's
//! continuation stack and walks the instruction tree of its effect, one
//! instruction at a time, on whichever worker thread the scheduler gives it.
//!
//! ## Run loop
//!
//! [`Driver::evaluate_now`] steps instructions until the fiber suspends,
//! finishes, or uses up its operation budget. Before each step it checks
//! for a pending interruption; once the fiber is interruptible and not
//! already unwinding, the interruption replaces the next instruction.
//!
//! ## Stacks
//!
//! Besides the continuation stack the driver keeps four region stacks:
//! interrupt status, environment, supervisor, and fork-scope override.
//! Entering a region pushes a value and an exit frame; the exit frame pops
//! the value whether the region succeeds or fails.
//!
//! ## Locking
//!
//! `run` is held for the whole of an evaluation and is only contended
//! briefly when a resumption is scheduled just before the current
//! evaluation returns. `state`, `fiber_refs` and the scope are leaf locks,
//! never held while calling user code or another driver.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::cause::Cause;
use crate::defect::Defect;
use crate::effect::{
    async_erased, chain_erased, done_erased, fold_erased, halt_erased, succeed_erased, unit, Cont,
    CauseCont, Effect, Erased, Instr, Never, RaceCont, Registration, Resume,
};
use crate::exit::Exit;
use crate::fiber::{
    next_fiber_id, Descriptor, FiberHandle, FiberId, FiberStatus, InterruptStatus, RuntimeFiber,
};
use crate::fiber_ref::{FiberRefs, RawFiberRef};
use crate::runtime::Platform;
use crate::scope::{Closing, Ensured, FiberScope, Scope};
use crate::supervisor::{self, Supervisor};
use crate::value::{Dynamic, Value};

type Observer = Box<dyn FnOnce(&Exit<Dynamic, Dynamic>) + Send>;

/// Reattach static types to an erased exit.
pub(crate) fn typed_exit<E: Value, A: Value>(exit: Exit<Dynamic, Dynamic>) -> Exit<E, A> {
    exit.map(Dynamic::take::<A>).map_err(Dynamic::take::<E>)
}

enum Status {
    Running,
    Suspended {
        interruptible: bool,
        epoch: u64,
        blocking_on: Vec<FiberId>,
        /// Set while the async registration callback is still running.
        registering: bool,
        canceler: Option<Erased>,
    },
}

enum FiberState {
    Executing {
        status: Status,
        interrupting: bool,
        observers: Vec<Observer>,
        /// Runtime bookkeeping run at exit. Hooks do not count as someone
        /// handling the fiber's failure.
        hooks: Vec<Observer>,
        interrupted: Cause<Never>,
    },
    Done(Exit<Dynamic, Dynamic>),
}

enum Frame {
    Apply(Cont),
    Fold { on_failure: CauseCont, on_success: Cont },
    InterruptExit,
    EnvironmentExit,
    SupervisorExit,
    ForkScopeExit,
}

struct RunState {
    stack: Vec<Frame>,
    interrupt_status: Vec<InterruptStatus>,
    environments: Vec<Dynamic>,
    supervisors: Vec<Arc<dyn Supervisor>>,
    fork_scopes: Vec<Option<FiberScope>>,
    async_epoch: u64,
}

impl RunState {
    fn interrupt_status(&self) -> InterruptStatus {
        self.interrupt_status.last().copied().unwrap_or_default()
    }

    fn supervisor(&self) -> Option<Arc<dyn Supervisor>> {
        self.supervisors.last().cloned()
    }
}

/// Everything a new fiber starts with.
pub(crate) struct FiberSeed {
    pub(crate) parent: Option<FiberId>,
    pub(crate) fiber_refs: FiberRefs,
    pub(crate) interrupt_status: InterruptStatus,
    pub(crate) environment: Dynamic,
    pub(crate) supervisor: Arc<dyn Supervisor>,
    pub(crate) report: bool,
}

/// Interpreter state of one fiber.
pub(crate) struct Driver {
    id: FiberId,
    platform: Arc<Platform>,
    state: Mutex<FiberState>,
    run: Mutex<RunState>,
    fiber_refs: Mutex<FiberRefs>,
    scope: FiberScope,
    supervisor: Arc<dyn Supervisor>,
    report: bool,
}

impl Driver {
    pub(crate) fn new(platform: Arc<Platform>, seed: FiberSeed) -> Arc<Self> {
        let id = next_fiber_id();
        trace!(fiber = %id, parent = ?seed.parent, "fiber created");
        Arc::new(Self {
            id,
            platform,
            state: Mutex::new(FiberState::Executing {
                status: Status::Running,
                interrupting: false,
                observers: Vec::new(),
                hooks: Vec::new(),
                interrupted: Cause::empty(),
            }),
            run: Mutex::new(RunState {
                stack: Vec::new(),
                interrupt_status: vec![seed.interrupt_status],
                environments: vec![seed.environment],
                supervisors: vec![Arc::clone(&seed.supervisor)],
                fork_scopes: Vec::new(),
                async_epoch: 0,
            }),
            fiber_refs: Mutex::new(seed.fiber_refs),
            scope: Scope::make(),
            supervisor: seed.supervisor,
            report: seed.report,
        })
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    fn handle(self: &Arc<Self>) -> RuntimeFiber {
        FiberHandle::from_driver(Arc::clone(self))
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Schedule `effect` to run on a worker.
    pub(crate) fn evaluate_later(self: &Arc<Self>, effect: Erased) {
        self.platform.scheduler.submit(Arc::clone(self), effect);
    }

    /// Run `effect` on the current thread until the fiber suspends,
    /// finishes, or has to yield.
    pub(crate) fn evaluate_now(self: &Arc<Self>, effect: Erased) {
        let mut run = self.run.lock();
        let max_ops = self.platform.max_ops_before_yield;
        let mut ops = 0usize;
        let mut current = Some(effect);

        while let Some(instr) = current.take() {
            if self.should_interrupt(&run) {
                let cause = self.begin_interrupting();
                current = Some(halt_erased(cause));
                continue;
            }
            if ops >= max_ops {
                trace!(fiber = %self.id, ops, "operation budget spent, yielding");
                self.evaluate_later(instr);
                break;
            }
            ops += 1;

            current = match catch_unwind(AssertUnwindSafe(|| self.step(&mut run, instr))) {
                Ok(next) => next,
                Err(payload) => {
                    let defect = Defect::from_panic(payload);
                    debug!(fiber = %self.id, %defect, "instruction panicked");
                    Some(halt_erased(Cause::die(defect)))
                }
            };
        }
    }

    fn step(self: &Arc<Self>, run: &mut RunState, instr: Erased) -> Option<Erased> {
        match &*instr {
            Instr::Succeed(value) => self.next_instr(run, value.clone()),
            Instr::Fail(cause) => self.unwind(run, cause.clone()),
            Instr::Total(thunk) => {
                let value = thunk();
                self.next_instr(run, value)
            }
            Instr::Partial(thunk) => match thunk() {
                Ok(value) => self.next_instr(run, value),
                Err(error) => Some(halt_erased(Cause::fail(error))),
            },
            Instr::Suspend(thunk) => Some(thunk()),
            Instr::Chain(first, next) => {
                run.stack.push(Frame::Apply(Arc::clone(next)));
                Some(Arc::clone(first))
            }
            Instr::Fold(first, on_failure, on_success) => {
                run.stack.push(Frame::Fold {
                    on_failure: Arc::clone(on_failure),
                    on_success: Arc::clone(on_success),
                });
                Some(Arc::clone(first))
            }
            Instr::Async {
                register,
                blocking_on,
            } => self.suspend_async(run, register.as_ref(), blocking_on.clone()),
            Instr::Fork {
                effect,
                scope,
                report,
            } => {
                let child = self.fork(run, Arc::clone(effect), scope.clone(), *report);
                self.next_instr(run, Dynamic::new(FiberHandle::<Dynamic, Dynamic>::from_driver(child)))
            }
            Instr::Race {
                left,
                right,
                left_wins,
                right_wins,
                scope,
            } => self.race(run, left, right, left_wins, right_wins, scope.clone()),
            Instr::InterruptStatus(effect, status) => {
                run.interrupt_status.push(*status);
                run.stack.push(Frame::InterruptExit);
                Some(Arc::clone(effect))
            }
            Instr::CheckInterrupt(f) => Some(f(run.interrupt_status())),
            Instr::Descriptor(f) => {
                let descriptor = self.descriptor(run);
                Some(f(descriptor))
            }
            Instr::Supervise(effect, supervisor) => {
                let combined = match run.supervisor() {
                    Some(outer) => supervisor::both(Arc::clone(supervisor), outer),
                    None => Arc::clone(supervisor),
                };
                run.supervisors.push(combined);
                run.stack.push(Frame::SupervisorExit);
                Some(Arc::clone(effect))
            }
            Instr::NewFiberRef {
                initial,
                fork,
                join,
            } => {
                let raw = RawFiberRef::new(initial.clone(), Arc::clone(fork), Arc::clone(join));
                self.fiber_refs.lock().set(&raw, initial.clone());
                self.next_instr(run, Dynamic::new(raw))
            }
            Instr::ModifyFiberRef(raw, f) => {
                let current = self.fiber_refs.lock().get(raw);
                let (result, updated) = f(current);
                self.fiber_refs.lock().set(raw, updated);
                self.next_instr(run, result)
            }
            Instr::GetForkScope(f) => {
                let scope = self.fork_scope(run);
                Some(f(scope))
            }
            Instr::OverrideForkScope(effect, scope) => {
                run.fork_scopes.push(scope.clone());
                run.stack.push(Frame::ForkScopeExit);
                Some(Arc::clone(effect))
            }
            Instr::Yield => {
                self.evaluate_later(succeed_erased(Dynamic::unit()));
                None
            }
            Instr::Access(f) => {
                let env = run.environments.last().cloned().unwrap_or_else(Dynamic::unit);
                Some(f(env))
            }
            Instr::Provide(env, effect) => {
                run.environments.push(env.clone());
                run.stack.push(Frame::EnvironmentExit);
                Some(Arc::clone(effect))
            }
            Instr::Platform(f) => Some(f(&self.platform)),
        }
    }

    /// Feed a success value to the next continuation.
    fn next_instr(self: &Arc<Self>, run: &mut RunState, value: Dynamic) -> Option<Erased> {
        loop {
            match run.stack.pop() {
                None => return self.try_done(Exit::Success(value)),
                Some(Frame::Apply(next)) => return Some(next(value)),
                Some(Frame::Fold { on_success, .. }) => return Some(on_success(value)),
                Some(Frame::InterruptExit) => {
                    run.interrupt_status.pop();
                    // Re-enter the loop so a deferred interruption is seen.
                    return Some(succeed_erased(value));
                }
                Some(Frame::EnvironmentExit) => {
                    run.environments.pop();
                }
                Some(Frame::SupervisorExit) => {
                    run.supervisors.pop();
                }
                Some(Frame::ForkScopeExit) => {
                    run.fork_scopes.pop();
                }
            }
        }
    }

    /// Unwind to the nearest failure handler. Handlers are skipped while the
    /// fiber is interrupted in an interruptible region.
    fn unwind(self: &Arc<Self>, run: &mut RunState, cause: Cause<Dynamic>) -> Option<Erased> {
        let mut discarded = false;
        while let Some(frame) = run.stack.pop() {
            match frame {
                Frame::Fold { on_failure, .. } => {
                    if self.is_interrupted() && run.interrupt_status().is_interruptible() {
                        discarded = true;
                        continue;
                    }
                    self.set_interrupting(false);
                    let cause = if discarded {
                        cause.strip_failures()
                    } else {
                        cause
                    };
                    return Some(on_failure(cause));
                }
                Frame::InterruptExit => {
                    run.interrupt_status.pop();
                }
                Frame::EnvironmentExit => {
                    run.environments.pop();
                }
                Frame::SupervisorExit => {
                    run.supervisors.pop();
                }
                Frame::ForkScopeExit => {
                    run.fork_scopes.pop();
                }
                Frame::Apply(_) => {}
            }
        }

        let mut cause = if discarded {
            cause.strip_failures()
        } else {
            cause
        };
        let interrupted = self.interrupted_cause();
        if !interrupted.is_empty() {
            let known = cause.interruptors();
            if !interrupted.interruptors().iter().all(|id| known.contains(id)) {
                cause = cause.then(interrupted.widen());
            }
        }
        self.set_interrupting(true);
        self.try_done(Exit::Failure(cause))
    }

    /// Close the fiber's scope, run its finalizers, then publish the exit.
    fn try_done(self: &Arc<Self>, exit: Exit<Dynamic, Dynamic>) -> Option<Erased> {
        if let Closing::Closed(Some(finalizers)) = self.scope.unsafe_close(exit.clone()) {
            trace!(fiber = %self.id, "running scope finalizers");
            self.set_interrupting(true);
            let on_failure = exit.clone();
            return Some(fold_erased(
                finalizers.instr,
                move |late| done_erased(on_failure.clone().then_cause(late)),
                move |_| done_erased(exit.clone()),
            ));
        }

        let (hooks, observers) = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, FiberState::Done(exit.clone())) {
                FiberState::Executing {
                    hooks, observers, ..
                } => (hooks, observers),
                FiberState::Done(previous) => {
                    *state = FiberState::Done(previous);
                    return None;
                }
            }
        };

        trace!(fiber = %self.id, success = exit.is_success(), "fiber done");
        if observers.is_empty() {
            self.report_unhandled(&exit);
        }
        for hook in hooks {
            hook(&exit);
        }
        self.supervisor.on_end(&exit, &self.handle());
        for observer in observers {
            observer(&exit);
        }
        None
    }

    fn report_unhandled(&self, exit: &Exit<Dynamic, Dynamic>) {
        if !self.report || !self.platform.report_unhandled {
            return;
        }
        if let Exit::Failure(cause) = exit {
            if !cause.interrupted_only() {
                warn!(
                    fiber = %self.id,
                    cause = %cause.pretty(),
                    "fiber failed with an unhandled error"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Interruption
    // ------------------------------------------------------------------

    fn should_interrupt(&self, run: &RunState) -> bool {
        if !run.interrupt_status().is_interruptible() {
            return false;
        }
        match &*self.state.lock() {
            FiberState::Executing {
                interrupted,
                interrupting,
                ..
            } => !interrupted.is_empty() && !*interrupting,
            FiberState::Done(_) => false,
        }
    }

    fn is_interrupted(&self) -> bool {
        match &*self.state.lock() {
            FiberState::Executing { interrupted, .. } => !interrupted.is_empty(),
            FiberState::Done(_) => false,
        }
    }

    fn interrupted_cause(&self) -> Cause<Never> {
        match &*self.state.lock() {
            FiberState::Executing { interrupted, .. } => interrupted.clone(),
            FiberState::Done(_) => Cause::empty(),
        }
    }

    fn set_interrupting(&self, value: bool) {
        if let FiberState::Executing { interrupting, .. } = &mut *self.state.lock() {
            *interrupting = value;
        }
    }

    /// Mark the fiber as unwinding and return the cause to unwind with.
    fn begin_interrupting(&self) -> Cause<Dynamic> {
        match &mut *self.state.lock() {
            FiberState::Executing {
                interrupting,
                interrupted,
                ..
            } => {
                *interrupting = true;
                interrupted.clone().widen()
            }
            FiberState::Done(_) => Cause::empty(),
        }
    }

    /// Record an interruption request from `by`. A fiber suspended in an
    /// interruptible region is woken right away, running the async canceler
    /// first if one was registered.
    pub(crate) fn deliver_interrupt(self: &Arc<Self>, by: FiberId) {
        let wake = {
            let mut state = self.state.lock();
            match &mut *state {
                FiberState::Done(_) => None,
                FiberState::Executing {
                    status,
                    interrupting,
                    interrupted,
                    ..
                } => {
                    *interrupted = std::mem::take(interrupted).both(Cause::interrupt(by));
                    match status {
                        Status::Suspended {
                            interruptible: true,
                            registering: false,
                            canceler,
                            ..
                        } => {
                            let canceler = canceler.take();
                            *status = Status::Running;
                            *interrupting = true;
                            Some(canceler)
                        }
                        _ => None,
                    }
                }
            }
        };

        if let Some(canceler) = wake {
            debug!(fiber = %self.id, by = %by, "interrupting suspended fiber");
            self.evaluate_later(then_halt(canceler, Cause::interrupt(by)));
        }
    }

    /// Effect that interrupts this fiber on behalf of `by` and waits for it.
    pub(crate) fn interrupt_as_erased(self: &Arc<Self>, by: FiberId) -> Erased {
        let driver = Arc::clone(self);
        Arc::new(Instr::Suspend(Arc::new(move || {
            driver.deliver_interrupt(by);
            driver.wait_erased()
        })))
    }

    // ------------------------------------------------------------------
    // Async boundaries
    // ------------------------------------------------------------------

    fn suspend_async(
        self: &Arc<Self>,
        run: &mut RunState,
        register: &(dyn Fn(Resume) -> Registration + Send + Sync),
        blocking_on: Vec<FiberId>,
    ) -> Option<Erased> {
        run.async_epoch += 1;
        let epoch = run.async_epoch;
        let interruptible = run.interrupt_status().is_interruptible();
        self.enter_async(epoch, interruptible, blocking_on);

        let driver = Arc::clone(self);
        let resume: Resume = Arc::new(move |effect| {
            if driver.exit_async(epoch) {
                driver.evaluate_later(effect);
            }
        });

        match catch_unwind(AssertUnwindSafe(|| register(resume))) {
            Ok(Registration::Ready(effect)) => self.exit_async(epoch).then_some(effect),
            Ok(Registration::Pending) => self.finish_registration(epoch, None),
            Ok(Registration::Canceler(canceler)) => {
                self.finish_registration(epoch, Some(canceler))
            }
            Err(payload) => self
                .exit_async(epoch)
                .then(|| halt_erased(Cause::die(Defect::from_panic(payload)))),
        }
    }

    fn enter_async(&self, epoch: u64, interruptible: bool, blocking_on: Vec<FiberId>) {
        if let FiberState::Executing { status, .. } = &mut *self.state.lock() {
            *status = Status::Suspended {
                interruptible,
                epoch,
                blocking_on,
                registering: true,
                canceler: None,
            };
        }
    }

    /// Leave the suspension for `epoch`. Only the first caller succeeds.
    fn exit_async(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            FiberState::Executing { status, .. } => match status {
                Status::Suspended { epoch: current, .. } if *current == epoch => {
                    *status = Status::Running;
                    true
                }
                _ => false,
            },
            FiberState::Done(_) => false,
        }
    }

    /// Registration returned without resolving. Store the canceler, or take
    /// over right away if an interruption arrived in the meantime.
    fn finish_registration(&self, epoch: u64, canceler: Option<Erased>) -> Option<Erased> {
        let mut state = self.state.lock();
        let FiberState::Executing {
            status,
            interrupting,
            interrupted,
            ..
        } = &mut *state
        else {
            return None;
        };
        match status {
            Status::Suspended {
                epoch: current,
                interruptible,
                registering,
                canceler: slot,
                ..
            } if *current == epoch => {
                if *interruptible && !interrupted.is_empty() {
                    let cause = interrupted.clone().widen();
                    *status = Status::Running;
                    *interrupting = true;
                    return Some(then_halt(canceler, cause));
                }
                *registering = false;
                *slot = canceler;
                None
            }
            _ => None,
        }
    }

    /// Register `observer` for the exit, or return the exit if the fiber is
    /// already done.
    fn add_observer_maybe(&self, observer: Observer) -> Option<Exit<Dynamic, Dynamic>> {
        let mut state = self.state.lock();
        match &mut *state {
            FiberState::Executing { observers, .. } => {
                observers.push(observer);
                None
            }
            FiberState::Done(exit) => Some(exit.clone()),
        }
    }

    /// Run `observer` when the fiber finishes, immediately if it already has.
    pub(crate) fn on_done<F>(&self, observer: F)
    where
        F: FnOnce(&Exit<Dynamic, Dynamic>) + Send + 'static,
    {
        self.watch(Box::new(observer), false);
    }

    /// Like [`on_done`](Self::on_done), but the callback is runtime
    /// bookkeeping: a failure seen only by hooks is still reported as
    /// unhandled.
    fn on_done_hook<F>(&self, hook: F)
    where
        F: FnOnce(&Exit<Dynamic, Dynamic>) + Send + 'static,
    {
        self.watch(Box::new(hook), true);
    }

    fn watch(&self, observer: Observer, hook: bool) {
        let mut slot = Some(observer);
        let ready = {
            let mut state = self.state.lock();
            match &mut *state {
                FiberState::Executing {
                    observers, hooks, ..
                } => {
                    if hook {
                        hooks.extend(slot.take());
                    } else {
                        observers.extend(slot.take());
                    }
                    None
                }
                FiberState::Done(exit) => Some(exit.clone()),
            }
        };
        if let (Some(exit), Some(observer)) = (ready, slot) {
            observer(&exit);
        }
    }

    /// Effect that waits for this fiber and succeeds with its exit.
    pub(crate) fn wait_erased(self: &Arc<Self>) -> Erased {
        let driver = Arc::clone(self);
        async_erased(
            move |resume: Resume| {
                let observer: Observer = Box::new(move |exit| {
                    resume(succeed_erased(Dynamic::new(exit.clone())));
                });
                match driver.add_observer_maybe(observer) {
                    Some(exit) => Registration::Ready(succeed_erased(Dynamic::new(exit))),
                    None => Registration::Pending,
                }
            },
            vec![self.id],
        )
    }

    pub(crate) fn poll_exit(&self) -> Option<Exit<Dynamic, Dynamic>> {
        match &*self.state.lock() {
            FiberState::Done(exit) => Some(exit.clone()),
            FiberState::Executing { .. } => None,
        }
    }

    // ------------------------------------------------------------------
    // Forking and racing
    // ------------------------------------------------------------------

    fn fork_scope(&self, run: &RunState) -> FiberScope {
        run.fork_scopes
            .last()
            .cloned()
            .flatten()
            .unwrap_or_else(|| self.scope.clone())
    }

    fn fork(
        self: &Arc<Self>,
        run: &RunState,
        effect: Erased,
        scope: Option<FiberScope>,
        report: bool,
    ) -> Arc<Driver> {
        let parent_scope = scope.unwrap_or_else(|| self.fork_scope(run));
        let supervisor = run.supervisor().unwrap_or_else(supervisor::none);
        let child = Driver::new(
            Arc::clone(&self.platform),
            FiberSeed {
                parent: Some(self.id),
                fiber_refs: self.fiber_refs.lock().fork(),
                interrupt_status: run.interrupt_status(),
                environment: run.environments.last().cloned().unwrap_or_else(Dynamic::unit),
                supervisor: Arc::clone(&supervisor),
                report,
            },
        );
        debug!(fiber = %self.id, child = %child.id, "fork");
        supervisor.on_start(Some(self.id), &child.handle());

        if !parent_scope.is_global() {
            let parent_id = self.id;
            let target = Arc::downgrade(&child);
            let ensured = parent_scope.ensure(move |exit: Exit<Dynamic, Dynamic>| {
                let by = interruptor_of(&exit, parent_id);
                match target.upgrade() {
                    Some(child) => Effect::<(), Never, Exit<Dynamic, Dynamic>>::from_erased(
                        child.interrupt_as_erased(by),
                    )
                    .unit(),
                    None => unit(),
                }
            });
            match ensured {
                Ensured::Closed(exit) => child.deliver_interrupt(interruptor_of(&exit, parent_id)),
                Ensured::Registered(key) => {
                    let scope = parent_scope.clone();
                    child.on_done_hook(move |_| {
                        scope.deny(&key);
                    });
                }
            }
        }

        self.platform.scheduler.submit(Arc::clone(&child), effect);
        child
    }

    fn race(
        self: &Arc<Self>,
        run: &RunState,
        left: &Erased,
        right: &Erased,
        left_wins: &RaceCont,
        right_wins: &RaceCont,
        scope: Option<FiberScope>,
    ) -> Option<Erased> {
        let left = self.fork(run, Arc::clone(left), scope.clone(), false);
        let right = self.fork(run, Arc::clone(right), scope, false);
        let decided = Arc::new(AtomicBool::new(false));
        let parent = self.id;
        let blocking_on = vec![left.id, right.id];
        let sides = [
            (Arc::clone(&left), Arc::clone(&right), Arc::clone(left_wins)),
            (right, left, Arc::clone(right_wins)),
        ];

        let register = async_erased(
            move |resume: Resume| {
                for (winner, loser, wins) in sides.iter() {
                    let resume = Arc::clone(&resume);
                    let decided = Arc::clone(&decided);
                    let loser = loser.handle();
                    let wins = Arc::clone(wins);
                    winner.on_done(move |exit| {
                        if !decided.swap(true, Ordering::AcqRel) {
                            let exit = exit.clone();
                            resume(Arc::new(Instr::Suspend(Arc::new(move || {
                                wins(exit.clone(), loser.clone())
                            }))));
                        }
                    });
                }
                let (first, second) = (Arc::clone(&sides[0].0), Arc::clone(&sides[0].1));
                Registration::Canceler(chain_erased(first.interrupt_as_erased(parent), move |_| {
                    second.interrupt_as_erased(parent)
                }))
            },
            blocking_on,
        );
        Some(register)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub(crate) fn status(&self) -> FiberStatus {
        match &*self.state.lock() {
            FiberState::Done(_) => FiberStatus::Done,
            FiberState::Executing {
                status: Status::Running,
                interrupting,
                ..
            } => FiberStatus::Running {
                interrupting: *interrupting,
            },
            FiberState::Executing {
                status:
                    Status::Suspended {
                        interruptible,
                        blocking_on,
                        ..
                    },
                ..
            } => FiberStatus::Suspended {
                interruptible: *interruptible,
                blocking_on: blocking_on.clone(),
            },
        }
    }

    fn descriptor(&self, run: &RunState) -> Descriptor {
        Descriptor {
            id: self.id,
            status: self.status(),
            interruptors: self.interrupted_cause().interruptors(),
            interrupt_status: run.interrupt_status(),
            scope: self.scope.clone(),
        }
    }

    pub(crate) fn fiber_ref_value(&self, fiber_ref: &RawFiberRef) -> Dynamic {
        self.fiber_refs.lock().get(fiber_ref)
    }

    pub(crate) fn fiber_ref_snapshot(&self) -> Vec<(RawFiberRef, Dynamic)> {
        self.fiber_refs.lock().snapshot()
    }
}

/// The fiber an exit was interrupted by, falling back to `fallback`.
fn interruptor_of(exit: &Exit<Dynamic, Dynamic>, fallback: FiberId) -> FiberId {
    exit.cause()
        .and_then(|cause| cause.interruptors().first().copied())
        .unwrap_or(fallback)
}

/// Run the canceler, if any, then fail with `cause`.
fn then_halt(canceler: Option<Erased>, cause: Cause<Dynamic>) -> Erased {
    match canceler {
        Some(canceler) => chain_erased(canceler, move |_| halt_erased(cause.clone())),
        None => halt_erased(cause),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_typed_exit_restores_types() {
        let exit: Exit<Dynamic, Dynamic> = Exit::succeed(Dynamic::new(5u8));
        assert_eq!(typed_exit::<String, u8>(exit), Exit::succeed(5u8));

        let exit: Exit<Dynamic, Dynamic> = Exit::fail(Dynamic::new(String::from("no")));
        assert_eq!(typed_exit::<String, u8>(exit), Exit::fail(String::from("no")));
    }

    #[test]
    fn test_interruptor_of_prefers_cause() {
        let exit: Exit<Dynamic, Dynamic> = Exit::interrupt(FiberId::new(9));
        assert_eq!(interruptor_of(&exit, FiberId::new(1)), FiberId::new(9));

        let exit: Exit<Dynamic, Dynamic> = Exit::succeed(Dynamic::unit());
        assert_eq!(interruptor_of(&exit, FiberId::new(1)), FiberId::new(1));
    }
}
