//! # Scopes
//!
//! A [`Scope`] is a set of finalizers that run, once, when the scope closes.
//! Every fiber owns a local scope; forked children register a finalizer in
//! their parent's scope that interrupts them, which is what ties a child's
//! lifetime to its parent.
//!
//! The [`Scope::Global`] scope never closes. Finalizers added to it are
//! accepted and never run, so fibers attached to it are daemons.
//!
//! ## Lifecycle
//!
//! A local scope is *open* until [`Scope::close`] records an exit value. It
//! is *released* once it is closed and no other scope still holds a
//! reference to it (see [`Scope::extend`]); finalizers run at that moment,
//! in the order they were added, and each receives the exit value.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::effect::{effect_total, halt, succeed, suspend, unit, Effect, Never};
use crate::exit::Exit;
use crate::value::{Dynamic, Value};

/// The scope children of a fiber attach to. Finalizers receive the exit of
/// the fiber that owns the scope.
pub type FiberScope = Scope<Exit<Dynamic, Dynamic>>;

/// A finalizer: builds the effect to run from the scope's exit value.
pub type Finalizer<A> = Arc<dyn Fn(A) -> Effect<(), Never, ()> + Send + Sync>;

/// Handle to a registered finalizer, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(u64);

impl Key {
    fn new() -> Self {
        static NEXT_KEY: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

/// Result of [`Scope::ensure`].
#[derive(Debug, Clone, PartialEq)]
pub enum Ensured<A> {
    /// The finalizer was added and will run when the scope is released.
    Registered(Key),
    /// The scope had already closed with this exit value; nothing was added.
    Closed(A),
}

struct ScopeState<A> {
    exit_value: Option<A>,
    references: usize,
    finalizers: Vec<(Key, Finalizer<A>)>,
    released: bool,
}

/// State shared by every handle to one local scope.
pub struct LocalScope<A> {
    state: Mutex<ScopeState<A>>,
}

/// A finalizer scope.
pub enum Scope<A> {
    /// The scope that never closes.
    Global,
    /// A scope that closes once.
    Local(Arc<LocalScope<A>>),
}

impl<A> Clone for Scope<A> {
    fn clone(&self) -> Self {
        match self {
            Scope::Global => Scope::Global,
            Scope::Local(local) => Scope::Local(Arc::clone(local)),
        }
    }
}

impl<A> fmt::Debug for Scope<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => f.write_str("Scope::Global"),
            Scope::Local(local) => {
                let state = local.state.lock();
                f.debug_struct("Scope::Local")
                    .field("closed", &state.exit_value.is_some())
                    .field("references", &state.references)
                    .field("finalizers", &state.finalizers.len())
                    .finish()
            }
        }
    }
}

/// Outcome of closing or releasing a local scope.
pub(crate) enum Closing {
    /// The scope was already closed.
    AlreadyClosed,
    /// Closed; finalizers to run, if the scope was also released.
    Closed(Option<Effect<(), Never, ()>>),
}

impl<A: Value> Scope<A> {
    /// The global scope.
    pub fn global() -> Self {
        Scope::Global
    }

    /// A new, open local scope.
    pub fn make() -> Self {
        Scope::Local(Arc::new(LocalScope {
            state: Mutex::new(ScopeState {
                exit_value: None,
                references: 1,
                finalizers: Vec::new(),
                released: false,
            }),
        }))
    }

    /// Whether this is the global scope.
    pub fn is_global(&self) -> bool {
        matches!(self, Scope::Global)
    }

    /// Whether the scope has recorded an exit value. Never true for the
    /// global scope.
    pub fn is_closed(&self) -> bool {
        match self {
            Scope::Global => false,
            Scope::Local(local) => local.state.lock().exit_value.is_some(),
        }
    }

    /// Whether the scope still accepts finalizers.
    pub fn is_open(&self) -> bool {
        !self.is_closed()
    }

    /// Whether the scope has run its finalizers.
    pub fn is_released(&self) -> bool {
        match self {
            Scope::Global => false,
            Scope::Local(local) => local.state.lock().released,
        }
    }

    /// Whether the scope holds no finalizers.
    pub fn is_empty(&self) -> bool {
        match self {
            Scope::Global => true,
            Scope::Local(local) => local.state.lock().finalizers.is_empty(),
        }
    }

    /// Add a finalizer.
    pub fn ensure<F>(&self, finalizer: F) -> Ensured<A>
    where
        F: Fn(A) -> Effect<(), Never, ()> + Send + Sync + 'static,
    {
        match self {
            Scope::Global => Ensured::Registered(Key::new()),
            Scope::Local(local) => {
                let mut state = local.state.lock();
                if let Some(exit) = &state.exit_value {
                    return Ensured::Closed(exit.clone());
                }
                let key = Key::new();
                state.finalizers.push((key, Arc::new(finalizer)));
                Ensured::Registered(key)
            }
        }
    }

    /// Remove a finalizer. Returns `false` once the scope has closed.
    pub fn deny(&self, key: &Key) -> bool {
        match self {
            Scope::Global => true,
            Scope::Local(local) => {
                let mut state = local.state.lock();
                if state.exit_value.is_some() {
                    return false;
                }
                state.finalizers.retain(|(k, _)| k != key);
                true
            }
        }
    }

    /// Keep `that` from releasing until this scope releases.
    ///
    /// Returns `true` if the scopes are now linked. Extending with the global
    /// scope, or with itself, always succeeds. Two local scopes are linked
    /// only while both are open. Closing `that` while it is linked records
    /// its exit but defers its finalizers until this scope releases it.
    pub fn extend<B: Value>(&self, that: &Scope<B>) -> bool {
        let that_local = match that {
            Scope::Global => return true,
            Scope::Local(local) => local,
        };
        match self {
            Scope::Global => that.add_ref(),
            Scope::Local(this) => {
                if Arc::as_ptr(this) as *const () == Arc::as_ptr(that_local) as *const () {
                    return true;
                }
                if self.is_closed() || !that.add_ref() {
                    return false;
                }
                let release = that.clone();
                match self.ensure(move |_| release.release()) {
                    Ensured::Registered(_) => true,
                    Ensured::Closed(_) => {
                        // Lost a race with close; hand the reference back.
                        that.drop_ref();
                        false
                    }
                }
            }
        }
    }

    /// Close the scope with `exit` and run its finalizers if nothing else
    /// holds it open. Returns `false` if the scope was already closed.
    pub fn close(&self, exit: A) -> Effect<(), Never, bool> {
        let this = self.clone();
        suspend(move || match this.unsafe_close(exit.clone()) {
            Closing::AlreadyClosed => succeed(false),
            Closing::Closed(None) => succeed(true),
            Closing::Closed(Some(run)) => run.map(|_| true),
        })
    }

    /// Drop one reference taken by [`Scope::extend`], running the finalizers
    /// if this was the last one and the scope is closed.
    pub fn release(&self) -> Effect<(), Never, ()> {
        let this = self.clone();
        suspend(move || match this.unsafe_release() {
            Some(run) => run,
            None => unit(),
        })
    }

    pub(crate) fn unsafe_close(&self, exit: A) -> Closing {
        match self {
            Scope::Global => Closing::AlreadyClosed,
            Scope::Local(local) => {
                let mut state = local.state.lock();
                if state.exit_value.is_some() {
                    return Closing::AlreadyClosed;
                }
                state.exit_value = Some(exit);
                state.references -= 1;
                Closing::Closed(take_if_released(&mut state))
            }
        }
    }

    fn unsafe_release(&self) -> Option<Effect<(), Never, ()>> {
        match self {
            Scope::Global => None,
            Scope::Local(local) => {
                let mut state = local.state.lock();
                state.references = state.references.saturating_sub(1);
                take_if_released(&mut state)
            }
        }
    }

    fn add_ref(&self) -> bool {
        match self {
            Scope::Global => true,
            Scope::Local(local) => {
                let mut state = local.state.lock();
                if state.exit_value.is_some() {
                    return false;
                }
                state.references += 1;
                true
            }
        }
    }

    fn drop_ref(&self) {
        if let Scope::Local(local) = self {
            let mut state = local.state.lock();
            state.references = state.references.saturating_sub(1);
        }
    }
}

/// If the scope is closed and unreferenced, take its finalizers and build
/// the effect that runs them.
fn take_if_released<A: Value>(state: &mut ScopeState<A>) -> Option<Effect<(), Never, ()>> {
    if state.references > 0 || state.released {
        return None;
    }
    let exit = state.exit_value.clone()?;
    state.released = true;
    let finalizers = std::mem::take(&mut state.finalizers);
    if finalizers.is_empty() {
        return None;
    }
    Some(run_finalizers(finalizers, exit))
}

/// Run finalizers in insertion order. Every finalizer runs even if an
/// earlier one fails; failures are combined sequentially.
fn run_finalizers<A: Value>(finalizers: Vec<(Key, Finalizer<A>)>, exit: A) -> Effect<(), Never, ()> {
    let mut run: Effect<(), Never, Cause<Never>> = effect_total(Cause::empty);
    for (_, finalizer) in finalizers {
        let exit = exit.clone();
        run = run.chain(move |acc: Cause<Never>| {
            let finalizer = Arc::clone(&finalizer);
            let exit = exit.clone();
            suspend(move || finalizer(exit.clone()))
                .result()
                .map(move |outcome| acc.clone().then(outcome.into_cause()))
        });
    }
    run.chain(|cause| {
        if cause.is_empty() {
            unit()
        } else {
            halt(cause)
        }
    })
    .uninterruptible()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_scope_accepts_and_ignores() {
        let scope: Scope<i32> = Scope::global();
        assert!(matches!(scope.ensure(|_| unit()), Ensured::Registered(_)));
        assert!(scope.is_open());
        assert!(scope.is_empty());
        assert!(matches!(scope.unsafe_close(1), Closing::AlreadyClosed));
    }

    #[test]
    fn test_ensure_after_close_returns_exit() {
        let scope: Scope<i32> = Scope::make();
        assert!(matches!(scope.unsafe_close(7), Closing::Closed(None)));
        assert_eq!(scope.ensure(|_| unit()), Ensured::Closed(7));
        assert!(scope.is_closed());
        assert!(scope.is_released());
    }

    #[test]
    fn test_close_twice() {
        let scope: Scope<i32> = Scope::make();
        assert!(matches!(scope.unsafe_close(1), Closing::Closed(_)));
        assert!(matches!(scope.unsafe_close(2), Closing::AlreadyClosed));
    }

    #[test]
    fn test_deny_removes_finalizer() {
        let scope: Scope<i32> = Scope::make();
        let key = match scope.ensure(|_| unit()) {
            Ensured::Registered(key) => key,
            Ensured::Closed(_) => panic!("scope should be open"),
        };
        assert!(!scope.is_empty());
        assert!(scope.deny(&key));
        assert!(scope.is_empty());
        assert!(matches!(scope.unsafe_close(0), Closing::Closed(None)));
        assert!(!scope.deny(&key));
    }

    #[test]
    fn test_close_with_finalizers_yields_effect() {
        let scope: Scope<i32> = Scope::make();
        scope.ensure(|_| unit());
        assert!(matches!(scope.unsafe_close(3), Closing::Closed(Some(_))));
        assert!(scope.is_empty());
    }

    #[test]
    fn test_extend_defers_release() {
        let parent: Scope<i32> = Scope::make();
        let child: Scope<i32> = Scope::make();
        child.ensure(|_| unit());
        assert!(parent.extend(&child));

        // Closing the child does not release it while the parent holds it.
        assert!(matches!(child.unsafe_close(1), Closing::Closed(None)));
        assert!(child.is_closed());
        assert!(!child.is_released());

        // The parent's finalizer releases the child.
        assert!(!parent.is_empty());
        assert!(child.unsafe_release().is_some());
        assert!(child.is_released());
    }

    #[test]
    fn test_extend_closed_scope_fails() {
        let parent: Scope<i32> = Scope::make();
        let child: Scope<i32> = Scope::make();
        assert!(matches!(child.unsafe_close(1), Closing::Closed(_)));
        assert!(!parent.extend(&child));
        assert!(parent.is_empty());

        let closed: Scope<i32> = Scope::make();
        assert!(matches!(closed.unsafe_close(1), Closing::Closed(_)));
        let open: Scope<i32> = Scope::make();
        assert!(!closed.extend(&open));
    }

    #[test]
    fn test_extend_trivial_cases() {
        let scope: Scope<i32> = Scope::make();
        assert!(scope.extend(&scope.clone()));
        assert!(scope.extend(&Scope::<u8>::global()));
        assert!(Scope::<u8>::global().extend(&scope));
    }
}
