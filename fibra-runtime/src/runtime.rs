//! # Runtime
//!
//! The entry point that turns effects into results. A [`Runtime`] owns a
//! worker pool, a clock, and the root supervisor; every fiber it starts
//! shares them through one [`Platform`].
//!
//! ## Usage
//!
//! ```rust
//! use fibra_runtime::prelude::*;
//!
//! let runtime = Runtime::new(RuntimeConfig::default());
//! let exit = runtime.run(succeed::<(), Never, _>(21).map(|n| n * 2));
//! assert_eq!(exit, Exit::succeed(42));
//! ```
//!
//! `run` blocks the calling thread until the effect's fiber finishes. Do not
//! call it from inside a fiber: with a single worker the fiber would wait on
//! itself. Use [`Runtime::run_async`] or fork instead.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use thiserror::Error;
use tracing::{debug, info};

use crate::clock::{Clock, LiveClock};
use crate::config::RuntimeConfig;
use crate::defect::Defect;
use crate::driver::{typed_exit, Driver, FiberSeed};
use crate::effect::Effect;
use crate::exit::Exit;
use crate::fiber::{FiberHandle, FiberId, InterruptStatus};
use crate::fiber_ref::FiberRefs;
use crate::scheduler::Scheduler;
use crate::supervisor::{self, Supervisor};
use crate::value::{Dynamic, Value};

/// Errors reported by the runtime itself rather than by an effect.
#[derive(Debug, Error)]
pub enum RunError {
    /// The effect did not finish within the configured timeout. Its fiber
    /// has been interrupted.
    #[error("effect did not complete within {0:?}")]
    Timeout(Duration),

    /// A worker or timer thread could not be started.
    #[error("failed to start runtime threads: {0}")]
    Spawn(#[from] io::Error),

    /// The runtime shut down before the effect finished.
    #[error("runtime shut down before the effect completed")]
    Shutdown,
}

/// Services shared by every fiber of one runtime.
pub(crate) struct Platform {
    pub(crate) scheduler: Scheduler,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) supervisor: Arc<dyn Supervisor>,
    pub(crate) max_ops_before_yield: usize,
    pub(crate) report_unhandled: bool,
}

impl Platform {
    fn shutdown(&self) {
        self.clock.shutdown();
        self.scheduler.shutdown();
    }
}

/// Builder for a [`Runtime`] with a custom clock or root supervisor.
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    clock: Option<Arc<dyn Clock>>,
    supervisor: Arc<dyn Supervisor>,
}

impl RuntimeBuilder {
    /// Start from `config`.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            clock: None,
            supervisor: supervisor::none(),
        }
    }

    /// Use `clock` instead of starting a [`LiveClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Supervise every fiber started by the runtime, including root fibers.
    pub fn supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Start the worker pool and, if needed, the timer thread.
    pub fn build(self) -> Result<Runtime, RunError> {
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(LiveClock::start()?),
        };
        let scheduler = Scheduler::start(&self.config.scheduler)?;
        info!(
            workers = scheduler.num_workers(),
            max_ops = self.config.scheduler.max_ops_before_yield,
            "runtime started"
        );
        let platform = Platform {
            scheduler,
            clock,
            supervisor: self.supervisor,
            max_ops_before_yield: self.config.scheduler.max_ops_before_yield.max(1),
            report_unhandled: self.config.log.report_unhandled,
        };
        Ok(Runtime {
            platform: Arc::new(platform),
            config: self.config,
        })
    }
}

/// Runs effects on a pool of worker threads.
pub struct Runtime {
    platform: Arc<Platform>,
    config: RuntimeConfig,
}

impl Runtime {
    /// Start a runtime.
    ///
    /// # Panics
    ///
    /// Panics if the worker or timer threads cannot be spawned. Use
    /// [`Runtime::try_new`] to handle that case.
    pub fn new(config: RuntimeConfig) -> Self {
        match Self::try_new(config) {
            Ok(runtime) => runtime,
            Err(err) => panic!("{err}"),
        }
    }

    /// Start a runtime, reporting thread spawn failures.
    pub fn try_new(config: RuntimeConfig) -> Result<Self, RunError> {
        RuntimeBuilder::new(config).build()
    }

    /// Builder for a runtime with a custom clock or supervisor.
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    /// The configuration the runtime was started with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run `effect` to completion and return its exit, waiting at most the
    /// configured default timeout.
    pub fn run<E: Value, A: Value>(&self, effect: Effect<(), E, A>) -> Exit<E, A> {
        self.run_with((), effect)
    }

    /// Run `effect` with `env` as its environment.
    pub fn run_with<R: Value, E: Value, A: Value>(
        &self,
        env: R,
        effect: Effect<R, E, A>,
    ) -> Exit<E, A> {
        self.run_for(env, effect, self.config.timeout.default_timeout)
    }

    /// Run `effect`, interrupting it if it has not finished after `timeout`.
    /// A timed-out run returns a [`RunError::Timeout`] defect.
    pub fn run_timeout<E: Value, A: Value>(
        &self,
        effect: Effect<(), E, A>,
        timeout: Duration,
    ) -> Exit<E, A> {
        self.run_for((), effect, Some(timeout))
    }

    fn run_for<R: Value, E: Value, A: Value>(
        &self,
        env: R,
        effect: Effect<R, E, A>,
        timeout: Option<Duration>,
    ) -> Exit<E, A> {
        let (tx, rx) = bounded(1);
        let driver = self.spawn_root(env, false);
        driver.on_done(move |exit| {
            let _ = tx.send(exit.clone());
        });
        driver.evaluate_later(effect.instr);

        let received = match timeout {
            Some(timeout) => rx.recv_timeout(timeout),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(exit) => typed_exit(exit),
            Err(RecvTimeoutError::Timeout) => {
                debug!(fiber = %driver.id(), ?timeout, "run timed out, interrupting");
                driver.deliver_interrupt(FiberId::NONE);
                Exit::die(Defect::new(RunError::Timeout(timeout.unwrap_or_default())))
            }
            Err(RecvTimeoutError::Disconnected) => Exit::die(Defect::new(RunError::Shutdown)),
        }
    }

    /// Start `effect` without blocking and call `callback` with its exit.
    pub fn run_async<E, A, F>(&self, effect: Effect<(), E, A>, callback: F) -> FiberHandle<E, A>
    where
        E: Value,
        A: Value,
        F: FnOnce(Exit<E, A>) + Send + 'static,
    {
        let driver = self.spawn_root((), false);
        driver.on_done(move |exit| callback(typed_exit(exit.clone())));
        driver.evaluate_later(effect.instr);
        FiberHandle::from_driver(driver)
    }

    /// Start `effect` as a root fiber and return its handle. If nobody waits
    /// on the fiber, a failure is logged when it finishes.
    pub fn fork<E: Value, A: Value>(&self, effect: Effect<(), E, A>) -> FiberHandle<E, A> {
        let driver = self.spawn_root((), true);
        driver.evaluate_later(effect.instr);
        FiberHandle::from_driver(driver)
    }

    fn spawn_root<R: Value>(&self, env: R, report: bool) -> Arc<Driver> {
        let supervisor = Arc::clone(&self.platform.supervisor);
        let driver = Driver::new(
            Arc::clone(&self.platform),
            FiberSeed {
                parent: None,
                fiber_refs: FiberRefs::new(),
                interrupt_status: InterruptStatus::Interruptible,
                environment: Dynamic::new(env),
                supervisor: Arc::clone(&supervisor),
                report,
            },
        );
        supervisor.on_start(None, &FiberHandle::from_driver(Arc::clone(&driver)));
        driver
    }

    /// Stop the worker and timer threads. Fibers still running are dropped
    /// without running their finalizers.
    pub fn shutdown(&self) {
        if !self.platform.scheduler.is_shutting_down() {
            let active = self.platform.scheduler.active_workers();
            self.platform.shutdown();
            info!(workers = active, "runtime stopped");
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::{fail, succeed, Never};
    use pretty_assertions::assert_eq;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::builder().num_workers(2).build_unchecked())
    }

    #[test]
    fn test_run_success_and_failure() {
        let runtime = runtime();
        assert_eq!(runtime.run(succeed::<(), Never, _>(7)), Exit::succeed(7));
        assert_eq!(
            runtime.run(fail::<(), _, u8>("bad".to_string())),
            Exit::fail("bad".to_string())
        );
    }

    #[test]
    fn test_run_with_environment() {
        let runtime = runtime();
        let effect = crate::effect::access::<u32, Never, u32, _>(|n| n + 1);
        assert_eq!(runtime.run_with(41, effect), Exit::succeed(42));
    }

    #[test]
    fn test_run_timeout_interrupts() {
        let runtime = runtime();
        let exit = runtime.run_timeout(
            crate::effect::never::<(), Never, ()>(),
            Duration::from_millis(20),
        );
        let defect = exit
            .cause()
            .and_then(|cause| cause.defects().first().cloned())
            .expect("timeout defect");
        assert!(defect.downcast_ref::<RunError>().is_some());
    }

    #[test]
    fn test_run_async_callback() {
        let runtime = runtime();
        let (tx, rx) = bounded(1);
        runtime.run_async(succeed::<(), Never, _>("done"), move |exit| {
            let _ = tx.send(exit);
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).expect("callback"),
            Exit::succeed("done")
        );
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let runtime = runtime();
        runtime.shutdown();
        runtime.shutdown();
        assert_eq!(runtime.config().scheduler.num_workers, 2);
    }

    #[test]
    fn test_run_error_display() {
        assert_eq!(
            RunError::Timeout(Duration::from_millis(5)).to_string(),
            "effect did not complete within 5ms"
        );
        assert_eq!(
            RunError::Shutdown.to_string(),
            "runtime shut down before the effect completed"
        );
    }
}
