//! # Fibra Runtime Library
//!
//! Fibra runs typed effects on lightweight fibers:
//!
//! - **Effects**: Inert, composable descriptions of work with a typed error
//!   channel and an environment
//! - **Causes**: Full failure reports that keep parallel and sequential
//!   errors, defects, and interruptions apart
//! - **Fibers**: M:N scheduled on a work-stealing pool, interruptible at
//!   instruction boundaries
//! - **Structured Concurrency**: Children are attached to their parent's
//!   scope and interrupted when it closes
//! - **Fiber Refs**: Per-fiber state with fork and join semantics
//! - **Supervision**: Observers for fiber lifecycles
//!
//! ## Technical Standards
//!
//! Implementation follows these standards:
//!
//! - **Work Stealing**: Based on Chase-Lev deque per
//!   [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - **Logging**: Structured events per [tracing](https://docs.rs/tracing)
//! - **Configuration**: TOML files per [toml](https://docs.rs/toml)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       FIBRA RUNTIME                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Effect    │  │    Cause     │  │  Sync/Clock  │          │
//! │  │ (effect.rs)  │  │  (cause.rs)  │  │  (sync.rs)   │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Driver    │  │  Scheduler   │  │    Scope     │          │
//! │  │ (driver.rs)  │  │(scheduler.rs)│  │  (scope.rs)  │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use fibra_runtime::prelude::*;
//!
//! let runtime = Runtime::new(RuntimeConfig::default());
//! let program = succeed::<(), Never, _>(1)
//!     .fork::<Never>()
//!     .chain(|fiber| fiber.join())
//!     .map(|n| n + 1);
//! assert_eq!(runtime.run(program), Exit::succeed(2));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cause;
pub mod clock;
pub mod config;
pub mod defect;
mod driver;
pub mod effect;
pub mod exit;
pub mod fiber;
pub mod fiber_ref;
pub mod log;
pub mod runtime;
mod scheduler;
pub mod scope;
pub mod supervisor;
pub mod sync;
pub mod timeout;
pub mod value;

// Re-exports
pub use cause::Cause;
pub use clock::{Clock, LiveClock, TimerId};
pub use config::{ConfigError, LogConfig, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use defect::{Defect, InterruptedError, PanicError};
pub use effect::{AsyncCallback, AsyncRegistration, Effect, InterruptStatusRestore, Never};
pub use exit::Exit;
pub use fiber::{Descriptor, FiberHandle, FiberId, FiberStatus, InterruptStatus, RuntimeFiber};
pub use fiber_ref::FiberRef;
pub use runtime::{RunError, Runtime, RuntimeBuilder};
pub use scope::{Ensured, FiberScope, Key, Scope};
pub use supervisor::{NoneSupervisor, Supervisor, TrackingSupervisor};
pub use sync::{Promise, Ref, Semaphore};
pub use timeout::{Deadline, TimeoutError};
pub use value::{Dynamic, Value};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything needed to write and run effects.
pub mod prelude {
    pub use crate::cause::Cause;
    pub use crate::clock::sleep;
    pub use crate::config::RuntimeConfig;
    pub use crate::defect::Defect;
    pub use crate::effect::{
        access, access_m, bracket_exit, check_interruptible, collect_all, descriptor,
        descriptor_with, die, die_message, done, effect_async, effect_async_interrupt,
        effect_async_m, effect_async_option, effect_partial, effect_total, environment, fail,
        fiber_id, foreach, foreach_par, foreach_unit, fork_scope, fork_scope_with, halt,
        interrupt, interrupt_as, interruptible_mask, never, succeed, suspend, try_catch,
        uninterruptible_mask, unit, yield_now, AsyncCallback, AsyncRegistration, Effect, Never,
    };
    pub use crate::exit::Exit;
    pub use crate::fiber::{FiberHandle, FiberId, FiberStatus, InterruptStatus};
    pub use crate::fiber_ref::FiberRef;
    pub use crate::runtime::Runtime;
    pub use crate::scope::{FiberScope, Scope};
    pub use crate::sync::{Promise, Ref, Semaphore};
    pub use crate::value::Value;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
