//! # Clock
//!
//! Time for fibers. A [`Clock`] tells the current instant and runs
//! callbacks after a delay; [`sleep`] suspends a fiber on it without tying up
//! a worker thread.
//!
//! [`LiveClock`] keeps every pending timer in one heap served by a single
//! timer thread, so a thousand sleeping fibers cost one thread, not a
//! thousand.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use tracing::{debug, error};

use crate::defect::Defect;
use crate::effect::{
    effect_async_interrupt, effect_total, succeed, with_platform, AsyncCallback,
    AsyncRegistration, Effect,
};
use crate::value::Value;

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Source of time and delayed callbacks.
pub trait Clock: Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> Instant;

    /// Run `callback` once `delay` has passed.
    fn schedule(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerId;

    /// Cancel a pending timer. Returns `false` if it already fired.
    fn cancel(&self, id: TimerId) -> bool;

    /// Stop serving timers and drop pending callbacks.
    fn shutdown(&self) {}
}

type Callback = Box<dyn FnOnce() + Send>;

struct TimerState {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    callbacks: FxHashMap<TimerId, Callback>,
    next_id: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// Wall-clock timers served by a dedicated thread.
pub struct LiveClock {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LiveClock {
    /// Start the timer thread.
    pub fn start() -> std::io::Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                callbacks: FxHashMap::default(),
                next_id: 1,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });
        let timer = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("fibra-timer".into())
            .spawn(move || timer_loop(&timer))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Number of timers that have not fired or been cancelled.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().callbacks.len()
    }
}

impl Clock for LiveClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerId {
        let mut state = self.shared.state.lock();
        let id = TimerId(state.next_id);
        state.next_id += 1;
        if state.shutdown {
            return id;
        }
        state.heap.push(Reverse((Instant::now() + delay, id)));
        state.callbacks.insert(id, callback);
        self.shared.wakeup.notify_one();
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        self.shared.state.lock().callbacks.remove(&id).is_some()
    }

    fn shutdown(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.heap.clear();
            std::mem::take(&mut state.callbacks)
        };
        self.shared.wakeup.notify_all();
        drop(dropped);

        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        debug!("timer thread stopped");
    }
}

impl Drop for LiveClock {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(shared: &TimerShared) {
    let mut state = shared.state.lock();
    while !state.shutdown {
        let next = state.heap.peek().map(|Reverse((at, id))| (*at, *id));
        match next {
            Some((at, id)) if at <= Instant::now() => {
                state.heap.pop();
                if let Some(callback) = state.callbacks.remove(&id) {
                    MutexGuard::unlocked(&mut state, || fire(callback));
                }
            }
            Some((at, _)) => {
                shared.wakeup.wait_until(&mut state, at);
            }
            None => shared.wakeup.wait(&mut state),
        }
    }
}

fn fire(callback: Callback) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
        error!(defect = %Defect::from_panic(payload), "timer callback panicked");
    }
}

/// Suspend the fiber for `duration`. Interrupting the sleep cancels the
/// timer.
pub fn sleep<R: 'static, E: Value>(duration: Duration) -> Effect<R, E, ()> {
    with_platform(move |platform| {
        let clock = Arc::clone(&platform.clock);
        effect_async_interrupt(move |callback: AsyncCallback<R, E, ()>| {
            let id = clock.schedule(duration, Box::new(move || callback.succeed(())));
            let clock = Arc::clone(&clock);
            AsyncRegistration::Canceler(effect_total(move || {
                clock.cancel(id);
            }))
        })
    })
}

/// The runtime clock's current instant.
pub fn now<R: 'static, E: Value>() -> Effect<R, E, Instant> {
    with_platform(|platform| succeed(platform.clock.now()))
}

impl<R: 'static, E: Value, A: Value> Effect<R, E, A> {
    /// Wait `duration`, then run this effect.
    pub fn delayed(self, duration: Duration) -> Effect<R, E, A> {
        sleep(duration).zip_right(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let clock = LiveClock::start().expect("timer thread");
        let (tx, rx) = bounded(3);
        for (delay, tag) in [(30u64, 'c'), (10, 'a'), (20, 'b')] {
            let tx = tx.clone();
            clock.schedule(
                Duration::from_millis(delay),
                Box::new(move || {
                    let _ = tx.send(tag);
                }),
            );
        }
        let order: Vec<char> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("timer fired"))
            .collect();
        assert_eq!(order, vec!['a', 'b', 'c']);
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let clock = LiveClock::start().expect("timer thread");
        let (tx, rx) = bounded(1);
        let id = clock.schedule(
            Duration::from_millis(20),
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        assert!(clock.cancel(id));
        assert!(!clock.cancel(id));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_shutdown_drops_pending() {
        let clock = LiveClock::start().expect("timer thread");
        clock.schedule(Duration::from_secs(60), Box::new(|| {}));
        assert_eq!(clock.pending(), 1);
        clock.shutdown();
        assert_eq!(clock.pending(), 0);
    }
}
