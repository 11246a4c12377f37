//! # Work-Stealing Fiber Scheduler
//!
//! M:N cooperative scheduler with work-stealing.
//!
//! ## Design
//!
//! - Multiple worker threads, each with a local deque
//! - Global injector for tasks submitted from outside the pool
//! - Work-stealing for load balancing
//! - Idle workers park with a timeout and are unparked round-robin on submit
//!
//! A task is one slice of a fiber's life: a driver plus the effect it should
//! evaluate next. A fiber is only ever queued once at a time; the driver's
//! async epochs guarantee a single resumption per suspension.
//!
//! ## Technical References
//!
//! - [Chase-Lev Deque](https://doi.org/10.1145/1073970.1073974)
//! - [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - [Tokio Scheduler](https://tokio.rs/blog/2019-10-scheduler)

use std::cell::RefCell;
use std::iter;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use crossbeam_utils::sync::{Parker, Unparker};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::config::SchedulerConfig;
use crate::defect::Defect;
use crate::driver::Driver;
use crate::effect::Erased;

/// A driver and the effect it should evaluate next.
pub(crate) struct Task {
    driver: Arc<Driver>,
    effect: Erased,
}

impl Task {
    fn run(self) {
        let Task { driver, effect } = self;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| driver.evaluate_now(effect))) {
            let defect = Defect::from_panic(payload);
            error!(fiber = %driver.id(), %defect, "fiber evaluation panicked");
        }
    }
}

static NEXT_SCHEDULER_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// The local deque of the worker running on this thread, tagged with its
    /// scheduler's id.
    static LOCAL: RefCell<Option<(usize, Deque<Task>)>> = const { RefCell::new(None) };
}

struct Shared {
    id: usize,
    injector: Injector<Task>,
    stealers: Vec<Stealer<Task>>,
    unparkers: Vec<Unparker>,
    next_unpark: AtomicUsize,
    shutdown: AtomicBool,
    active_workers: AtomicUsize,
    idle_park: Duration,
}

/// Work-stealing scheduler for fiber tasks.
pub(crate) struct Scheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Start the worker threads.
    pub(crate) fn start(config: &SchedulerConfig) -> std::io::Result<Self> {
        let num_workers = config.num_workers.max(1);
        let deques: Vec<Deque<Task>> = iter::repeat_with(Deque::new_fifo).take(num_workers).collect();
        let parkers: Vec<Parker> = iter::repeat_with(Parker::new).take(num_workers).collect();

        let shared = Arc::new(Shared {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            injector: Injector::new(),
            stealers: deques.iter().map(Deque::stealer).collect(),
            unparkers: parkers.iter().map(|p| p.unparker().clone()).collect(),
            next_unpark: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            active_workers: AtomicUsize::new(0),
            idle_park: config.idle_park,
        });

        let scheduler = Scheduler {
            shared: Arc::clone(&shared),
            threads: Mutex::new(Vec::with_capacity(num_workers)),
        };

        for (index, (deque, parker)) in deques.into_iter().zip(parkers).enumerate() {
            let worker = Worker {
                index,
                shared: Arc::clone(&shared),
                parker,
            };
            let handle = thread::Builder::new()
                .name(format!("fibra-worker-{}", index))
                .spawn(move || worker.run_loop(deque));
            match handle {
                Ok(handle) => scheduler.threads.lock().push(handle),
                Err(err) => {
                    scheduler.shutdown();
                    return Err(err);
                }
            }
        }

        debug!(workers = num_workers, "scheduler started");
        Ok(scheduler)
    }

    /// Get the number of workers.
    pub(crate) fn num_workers(&self) -> usize {
        self.shared.stealers.len()
    }

    /// Queue `effect` to be evaluated by `driver`.
    pub(crate) fn submit(&self, driver: Arc<Driver>, effect: Erased) {
        let task = Task { driver, effect };
        if self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let task = LOCAL.with(|local| match &*local.borrow() {
            Some((id, deque)) if *id == self.shared.id => {
                deque.push(task);
                None
            }
            _ => Some(task),
        });
        if let Some(task) = task {
            self.shared.injector.push(task);
        }
        self.shared.unpark_one();
    }

    /// Stop the workers and drop queued tasks. Blocks until every worker
    /// thread has exited, unless called from one of them.
    pub(crate) fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for unparker in &self.shared.unparkers {
            unparker.unpark();
        }

        let current = thread::current().id();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }

        while !self.shared.injector.is_empty() {
            let _ = self.shared.injector.steal();
        }
        debug!("scheduler stopped");
    }

    /// Check if the scheduler is shutting down.
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Number of workers currently inside their run loop.
    pub(crate) fn active_workers(&self) -> usize {
        self.shared.active_workers.load(Ordering::Acquire)
    }
}

impl Shared {
    fn unpark_one(&self) {
        let next = self.next_unpark.fetch_add(1, Ordering::Relaxed);
        self.unparkers[next % self.unparkers.len()].unpark();
    }
}

/// A worker thread in the scheduler.
struct Worker {
    index: usize,
    shared: Arc<Shared>,
    parker: Parker,
}

impl Worker {
    /// Run the worker loop.
    fn run_loop(self, local: Deque<Task>) {
        self.shared.active_workers.fetch_add(1, Ordering::AcqRel);
        LOCAL.with(|slot| *slot.borrow_mut() = Some((self.shared.id, local)));

        while !self.shared.shutdown.load(Ordering::Acquire) {
            match self.find_work() {
                Some(task) => task.run(),
                None => self.parker.park_timeout(self.shared.idle_park),
            }
        }

        // Drop whatever is left in the local deque.
        LOCAL.with(|slot| slot.borrow_mut().take());
        self.shared.active_workers.fetch_sub(1, Ordering::AcqRel);
        debug!(worker = self.index, "worker exited");
    }

    /// Find work using work-stealing.
    fn find_work(&self) -> Option<Task> {
        // 1. Try local queue first
        let local = LOCAL.with(|slot| slot.borrow().as_ref().and_then(|(_, deque)| deque.pop()));
        if local.is_some() {
            return local;
        }

        // 2. Try global queue, moving a batch into the local deque
        let global = LOCAL.with(|slot| {
            let slot = slot.borrow();
            let (_, deque) = slot.as_ref()?;
            loop {
                match self.shared.injector.steal_batch_and_pop(deque) {
                    Steal::Success(task) => return Some(task),
                    Steal::Empty => return None,
                    Steal::Retry => continue,
                }
            }
        });
        if global.is_some() {
            return global;
        }

        // 3. Try stealing from other workers
        for (index, stealer) in self.shared.stealers.iter().enumerate() {
            if index == self.index {
                continue;
            }
            loop {
                match stealer.steal() {
                    Steal::Success(task) => return Some(task),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn config(num_workers: usize) -> SchedulerConfig {
        SchedulerConfig {
            num_workers,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn test_scheduler_creation() {
        let scheduler = Scheduler::start(&config(3)).expect("spawn workers");
        assert_eq!(scheduler.num_workers(), 3);
        scheduler.shutdown();
        assert!(scheduler.is_shutting_down());
    }

    #[test]
    fn test_zero_workers_clamped() {
        let scheduler = Scheduler::start(&config(0)).expect("spawn workers");
        assert_eq!(scheduler.num_workers(), 1);
        scheduler.shutdown();
    }

    #[test]
    fn test_shutdown_joins_workers() {
        let scheduler = Scheduler::start(&config(2)).expect("spawn workers");
        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.active_workers() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        scheduler.shutdown();
        assert_eq!(scheduler.active_workers(), 0);
        // A second shutdown is a no-op.
        scheduler.shutdown();
    }
}
