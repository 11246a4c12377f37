//! Fiber References
//!
//! A [`FiberRef`] is a variable whose value is local to each fiber, similar to
//! thread-local storage but scoped to fibers rather than OS threads.
//!
//! # Overview
//!
//! - A fiber that never wrote a ref reads its initial value.
//! - On fork, the child starts from the parent's value passed through the
//!   ref's `fork` function.
//! - On join, the parent's value becomes `join(parent, child)`.
//!
//! This makes fiber refs suitable for request-scoped context (trace ids,
//! log annotations) that should flow into children and, optionally, back.
//!
//! # Example
//!
//! ```rust
//! use fibra_runtime::prelude::*;
//!
//! let runtime = Runtime::new(RuntimeConfig::default());
//! let program = FiberRef::make(0u32).chain(|counter| {
//!     counter
//!         .update(|n| n + 1)
//!         .chain(move |_| counter.get())
//! });
//! let exit: Exit<Never, u32> = runtime.run(program);
//! assert_eq!(exit, Exit::succeed(1));
//! ```

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::effect::{Effect, Erased, Instr};
use crate::value::{Dynamic, Value};

/// Unique key for a fiber ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberRefId(u64);

impl FiberRefId {
    /// Generate a new unique key.
    pub fn new() -> Self {
        static NEXT_KEY: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for FiberRefId {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) type ForkFn = Arc<dyn Fn(&Dynamic) -> Dynamic + Send + Sync>;
pub(crate) type JoinFn = Arc<dyn Fn(&Dynamic, &Dynamic) -> Dynamic + Send + Sync>;

struct FiberRefInner {
    id: FiberRefId,
    initial: Dynamic,
    fork: ForkFn,
    join: JoinFn,
}

/// A fiber ref with its value type erased.
#[derive(Clone)]
pub(crate) struct RawFiberRef(Arc<FiberRefInner>);

impl RawFiberRef {
    pub(crate) fn new(initial: Dynamic, fork: ForkFn, join: JoinFn) -> Self {
        Self(Arc::new(FiberRefInner {
            id: FiberRefId::new(),
            initial,
            fork,
            join,
        }))
    }

    pub(crate) fn id(&self) -> FiberRefId {
        self.0.id
    }

    /// Effect that folds a child's value into the running fiber's value.
    pub(crate) fn join_into(self, child: Dynamic) -> Erased {
        let join = Arc::clone(&self.0.join);
        Arc::new(Instr::ModifyFiberRef(
            self,
            Arc::new(move |parent: Dynamic| (Dynamic::unit(), join(&parent, &child))),
        ))
    }
}

/// Per-fiber fiber-ref values.
#[derive(Clone, Default)]
pub(crate) struct FiberRefs {
    values: FxHashMap<FiberRefId, (RawFiberRef, Dynamic)>,
    /// Forks between the root fiber and this one.
    depth: usize,
}

impl FiberRefs {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Current value. A ref no ancestor ever set reads as its initial value
    /// passed through `fork` once per fork down to this fiber.
    pub(crate) fn get(&self, fiber_ref: &RawFiberRef) -> Dynamic {
        match self.values.get(&fiber_ref.id()) {
            Some((_, value)) => value.clone(),
            None => (0..self.depth).fold(fiber_ref.0.initial.clone(), |value, _| {
                (fiber_ref.0.fork)(&value)
            }),
        }
    }

    pub(crate) fn set(&mut self, fiber_ref: &RawFiberRef, value: Dynamic) {
        self.values
            .insert(fiber_ref.id(), (fiber_ref.clone(), value));
    }

    /// Values a child fiber starts with.
    pub(crate) fn fork(&self) -> FiberRefs {
        let values = self
            .values
            .iter()
            .map(|(id, (fiber_ref, value))| {
                (*id, (fiber_ref.clone(), (fiber_ref.0.fork)(value)))
            })
            .collect();
        FiberRefs {
            values,
            depth: self.depth + 1,
        }
    }

    /// Every ref this fiber has set, with its value.
    pub(crate) fn snapshot(&self) -> Vec<(RawFiberRef, Dynamic)> {
        self.values.values().cloned().collect()
    }
}

/// A fiber-local variable holding an `A`.
pub struct FiberRef<A> {
    raw: RawFiberRef,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for FiberRef<A> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> std::fmt::Debug for FiberRef<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FiberRef").field(&self.raw.id()).finish()
    }
}

impl<A: Value> FiberRef<A> {
    /// Declare a fiber ref outside any fiber. Children inherit the parent's
    /// value unchanged and joins keep the child's value.
    pub fn new(initial: A) -> Self {
        Self::with_ops(initial, A::clone, |_, child| child.clone())
    }

    /// Declare a fiber ref with custom fork and join behavior.
    pub fn with_ops<F, J>(initial: A, fork: F, join: J) -> Self
    where
        F: Fn(&A) -> A + Send + Sync + 'static,
        J: Fn(&A, &A) -> A + Send + Sync + 'static,
    {
        let (fork, join) = erase_ops(fork, join);
        Self::from_raw(RawFiberRef::new(Dynamic::new(initial), fork, join))
    }

    pub(crate) fn from_raw(raw: RawFiberRef) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub(crate) fn raw(&self) -> &RawFiberRef {
        &self.raw
    }

    /// Effect that allocates a new fiber ref and sets it in the running
    /// fiber.
    pub fn make<R: 'static, E: Value>(initial: A) -> Effect<R, E, FiberRef<A>> {
        Self::make_with(initial, A::clone, |_, child| child.clone())
    }

    /// Like [`FiberRef::make`], with custom fork and join behavior.
    pub fn make_with<R: 'static, E: Value, F, J>(
        initial: A,
        fork: F,
        join: J,
    ) -> Effect<R, E, FiberRef<A>>
    where
        F: Fn(&A) -> A + Send + Sync + 'static,
        J: Fn(&A, &A) -> A + Send + Sync + 'static,
    {
        let (fork, join) = erase_ops(fork, join);
        Effect::<R, E, RawFiberRef>::from_instr(Instr::NewFiberRef {
            initial: Dynamic::new(initial),
            fork,
            join,
        })
        .map(FiberRef::from_raw)
    }

    /// Atomically modify the running fiber's value, returning a summary.
    pub fn modify<R: 'static, E: Value, B: Value, F>(&self, f: F) -> Effect<R, E, B>
    where
        F: Fn(A) -> (B, A) + Send + Sync + 'static,
    {
        Effect::from_instr(Instr::ModifyFiberRef(
            self.raw.clone(),
            Arc::new(move |current: Dynamic| {
                let (b, a) = f(current.take::<A>());
                (Dynamic::new(b), Dynamic::new(a))
            }),
        ))
    }

    /// Read the running fiber's value.
    pub fn get<R: 'static, E: Value>(&self) -> Effect<R, E, A> {
        self.modify(|a: A| (a.clone(), a))
    }

    /// Replace the running fiber's value.
    pub fn set<R: 'static, E: Value>(&self, value: A) -> Effect<R, E, ()> {
        self.modify(move |_| ((), value.clone()))
    }

    /// Replace the value and return the previous one.
    pub fn get_and_set<R: 'static, E: Value>(&self, value: A) -> Effect<R, E, A> {
        self.modify(move |old| (old, value.clone()))
    }

    /// Apply `f` to the value.
    pub fn update<R: 'static, E: Value, F>(&self, f: F) -> Effect<R, E, ()>
    where
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.modify(move |a| ((), f(a)))
    }

    /// Apply `f` to the value and return the new value.
    pub fn update_and_get<R: 'static, E: Value, F>(&self, f: F) -> Effect<R, E, A>
    where
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.modify(move |a| {
            let next = f(a);
            (next.clone(), next)
        })
    }

    /// Run `effect` with the ref set to `value`, restoring the previous value
    /// afterwards whether `effect` succeeds or not.
    pub fn locally<R: 'static, E: Value, B: Value>(
        &self,
        value: A,
        effect: Effect<R, E, B>,
    ) -> Effect<R, E, B> {
        let this = self.clone();
        self.get_and_set(value).chain(move |old| {
            effect.clone().ensuring(this.set(old))
        })
    }
}

fn erase_ops<A, F, J>(fork: F, join: J) -> (ForkFn, JoinFn)
where
    A: Value,
    F: Fn(&A) -> A + Send + Sync + 'static,
    J: Fn(&A, &A) -> A + Send + Sync + 'static,
{
    let fork: ForkFn = Arc::new(move |value: &Dynamic| match value.downcast_ref::<A>() {
        Some(a) => Dynamic::new(fork(a)),
        None => value.clone(),
    });
    let join: JoinFn = Arc::new(move |parent: &Dynamic, child: &Dynamic| {
        match (parent.downcast_ref::<A>(), child.downcast_ref::<A>()) {
            (Some(p), Some(c)) => Dynamic::new(join(p, c)),
            _ => child.clone(),
        }
    });
    (fork, join)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_ref_id_unique() {
        let a = FiberRefId::new();
        let b = FiberRefId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_unset_ref_reads_initial() {
        let refs = FiberRefs::new();
        let counter = FiberRef::new(10u32);
        assert_eq!(refs.get(counter.raw()).take::<u32>(), 10);
    }

    #[test]
    fn test_set_and_get() {
        let mut refs = FiberRefs::new();
        let name = FiberRef::new(String::from("root"));
        refs.set(name.raw(), Dynamic::new(String::from("child")));
        assert_eq!(refs.get(name.raw()).take::<String>(), "child");
    }

    #[test]
    fn test_fork_applies_fork_fn() {
        let mut refs = FiberRefs::new();
        let depth = FiberRef::with_ops(0u32, |d| d + 1, |p, _| *p);
        refs.set(depth.raw(), Dynamic::new(3u32));
        let child = refs.fork();
        assert_eq!(child.get(depth.raw()).take::<u32>(), 4);
        assert_eq!(refs.get(depth.raw()).take::<u32>(), 3);
    }

    #[test]
    fn test_fork_applies_to_unset_refs() {
        let refs = FiberRefs::new();
        let depth = FiberRef::with_ops(0u32, |d| d + 1, |p, _| *p);
        let grandchild = refs.fork().fork();
        assert_eq!(refs.get(depth.raw()).take::<u32>(), 0);
        assert_eq!(grandchild.get(depth.raw()).take::<u32>(), 2);
    }

    #[test]
    fn test_snapshot_lists_set_refs() {
        let mut refs = FiberRefs::new();
        let a = FiberRef::new(1i32);
        let b = FiberRef::new(2i32);
        refs.set(a.raw(), Dynamic::new(5i32));
        refs.set(b.raw(), Dynamic::new(6i32));
        let mut values: Vec<i32> = refs
            .snapshot()
            .into_iter()
            .map(|(_, v)| v.take::<i32>())
            .collect();
        values.sort();
        assert_eq!(values, vec![5, 6]);
    }
}
