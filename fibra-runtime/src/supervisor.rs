//! Supervisors
//!
//! A [`Supervisor`] observes the lifecycle of fibers forked while it is
//! installed with [`Effect::supervised`](crate::effect::Effect::supervised):
//! it hears about every fork and every completion. Supervisors nest; an
//! inner supervisor is combined with the outer ones so both keep seeing
//! events.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::effect::{effect_total, Effect};
use crate::exit::Exit;
use crate::fiber::{FiberId, RuntimeFiber};
use crate::value::{Dynamic, Value};

/// Observer of fiber starts and ends.
pub trait Supervisor: Send + Sync + 'static {
    /// Called by the parent when `fiber` is forked.
    fn on_start(&self, parent: Option<FiberId>, fiber: &RuntimeFiber);

    /// Called when `fiber` finishes with `exit`.
    fn on_end(&self, exit: &Exit<Dynamic, Dynamic>, fiber: &RuntimeFiber);

    /// Whether this supervisor ignores every event.
    fn is_none(&self) -> bool {
        false
    }
}

/// The supervisor that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoneSupervisor;

impl Supervisor for NoneSupervisor {
    fn on_start(&self, _parent: Option<FiberId>, _fiber: &RuntimeFiber) {}

    fn on_end(&self, _exit: &Exit<Dynamic, Dynamic>, _fiber: &RuntimeFiber) {}

    fn is_none(&self) -> bool {
        true
    }
}

/// Tracks the fibers that are currently alive.
#[derive(Default)]
pub struct TrackingSupervisor {
    fibers: Mutex<FxHashMap<FiberId, RuntimeFiber>>,
}

impl TrackingSupervisor {
    /// Create an empty tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Live fibers, ordered by id.
    pub fn fibers(&self) -> Vec<RuntimeFiber> {
        let mut fibers: Vec<RuntimeFiber> = self.fibers.lock().values().cloned().collect();
        fibers.sort_by_key(RuntimeFiber::id);
        fibers
    }

    /// Effect reading the live fibers.
    pub fn value<R: 'static, E: Value>(self: &Arc<Self>) -> Effect<R, E, Vec<RuntimeFiber>> {
        let this = Arc::clone(self);
        effect_total(move || this.fibers())
    }
}

impl Supervisor for TrackingSupervisor {
    fn on_start(&self, _parent: Option<FiberId>, fiber: &RuntimeFiber) {
        self.fibers.lock().insert(fiber.id(), fiber.clone());
    }

    fn on_end(&self, _exit: &Exit<Dynamic, Dynamic>, fiber: &RuntimeFiber) {
        self.fibers.lock().remove(&fiber.id());
    }
}

/// Two supervisors receiving the same events, left first.
struct Both {
    left: Arc<dyn Supervisor>,
    right: Arc<dyn Supervisor>,
}

impl Supervisor for Both {
    fn on_start(&self, parent: Option<FiberId>, fiber: &RuntimeFiber) {
        self.left.on_start(parent, fiber);
        self.right.on_start(parent, fiber);
    }

    fn on_end(&self, exit: &Exit<Dynamic, Dynamic>, fiber: &RuntimeFiber) {
        self.left.on_end(exit, fiber);
        self.right.on_end(exit, fiber);
    }
}

/// Combine two supervisors, skipping no-op ones.
pub fn both(left: Arc<dyn Supervisor>, right: Arc<dyn Supervisor>) -> Arc<dyn Supervisor> {
    if left.is_none() {
        return right;
    }
    if right.is_none() {
        return left;
    }
    Arc::new(Both { left, right })
}

/// The shared no-op supervisor.
pub fn none() -> Arc<dyn Supervisor> {
    Arc::new(NoneSupervisor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_skips_none() {
        let tracker: Arc<dyn Supervisor> = TrackingSupervisor::new();
        let combined = both(none(), Arc::clone(&tracker));
        assert!(Arc::ptr_eq(&combined, &tracker));
        assert!(both(none(), none()).is_none());
    }
}
