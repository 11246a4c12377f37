//! # Causes
//!
//! A [`Cause`] is the full reason an effect failed. It is a tree whose leaves
//! are typed failures (`Fail`), defects (`Die`) and interruptions
//! (`Interrupt`), combined sequentially (`Then`, one happened after the other)
//! or in parallel (`Both`, they happened concurrently).
//!
//! The constructors [`Cause::then`] and [`Cause::both`] collapse `Empty`
//! operands, so a cause built through them never holds a redundant empty
//! branch.
//!
//! ## Example
//!
//! ```rust
//! use fibra_runtime::cause::Cause;
//! use fibra_runtime::fiber::FiberId;
//!
//! let cause = Cause::fail("boom").then(Cause::interrupt(FiberId::new(3)));
//! assert_eq!(cause.failure_option(), Some("boom"));
//! assert!(cause.interrupted());
//! ```

use std::convert::Infallible;
use std::fmt;

use crate::defect::{Defect, InterruptedError};
use crate::fiber::FiberId;

/// Why an effect failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause<E> {
    /// No failure at all.
    Empty,
    /// A typed, expected failure.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// Interruption by the given fiber.
    Interrupt(FiberId),
    /// The left cause happened, then the right one.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Both causes happened concurrently.
    Both(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Default for Cause<E> {
    fn default() -> Self {
        Cause::Empty
    }
}

impl<E> Cause<E> {
    /// The empty cause.
    pub fn empty() -> Self {
        Cause::Empty
    }

    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    /// A defect.
    pub fn die(defect: Defect) -> Self {
        Cause::Die(defect)
    }

    /// An interruption by `fiber`.
    pub fn interrupt(fiber: FiberId) -> Self {
        Cause::Interrupt(fiber)
    }

    /// Sequential composition. `Empty` on either side yields the other side.
    pub fn then(self, right: Cause<E>) -> Self {
        match (self, right) {
            (Cause::Empty, right) => right,
            (left, Cause::Empty) => left,
            (left, right) => Cause::Then(Box::new(left), Box::new(right)),
        }
    }

    /// Parallel composition. `Empty` on either side yields the other side.
    pub fn both(self, right: Cause<E>) -> Self {
        match (self, right) {
            (Cause::Empty, right) => right,
            (left, Cause::Empty) => left,
            (left, right) => Cause::Both(Box::new(left), Box::new(right)),
        }
    }

    /// Take the cause out, leaving `Empty` behind.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// Search the tree in pre-order, left to right, for the first node where
    /// `f` returns a value. `Empty` never matches.
    pub fn find<'a, Z, F>(&'a self, mut f: F) -> Option<Z>
    where
        F: FnMut(&'a Cause<E>) -> Option<Z>,
    {
        let mut stack = vec![self];
        while let Some(cause) = stack.pop() {
            if let Cause::Empty = cause {
                continue;
            }
            if let Some(z) = f(cause) {
                return Some(z);
            }
            if let Cause::Then(left, right) | Cause::Both(left, right) = cause {
                stack.push(right);
                stack.push(left);
            }
        }
        None
    }

    /// Visit every node in pre-order, left to right, threading an
    /// accumulator. Nodes where `f` returns `None` leave it unchanged.
    pub fn fold_left<'a, Z, F>(&'a self, zero: Z, mut f: F) -> Z
    where
        F: FnMut(&Z, &'a Cause<E>) -> Option<Z>,
    {
        let mut acc = zero;
        let mut stack = vec![self];
        while let Some(cause) = stack.pop() {
            if let Some(next) = f(&acc, cause) {
                acc = next;
            }
            if let Cause::Then(left, right) | Cause::Both(left, right) = cause {
                stack.push(right);
                stack.push(left);
            }
        }
        acc
    }

    /// Structural fold over the tree.
    #[allow(clippy::too_many_arguments)]
    pub fn fold<Z>(
        &self,
        empty: &impl Fn() -> Z,
        fail: &impl Fn(&E) -> Z,
        die: &impl Fn(&Defect) -> Z,
        interrupt: &impl Fn(FiberId) -> Z,
        then: &impl Fn(Z, Z) -> Z,
        both: &impl Fn(Z, Z) -> Z,
    ) -> Z {
        match self {
            Cause::Empty => empty(),
            Cause::Fail(e) => fail(e),
            Cause::Die(d) => die(d),
            Cause::Interrupt(id) => interrupt(*id),
            Cause::Then(l, r) => {
                let l = l.fold(empty, fail, die, interrupt, then, both);
                let r = r.fold(empty, fail, die, interrupt, then, both);
                then(l, r)
            }
            Cause::Both(l, r) => {
                let l = l.fold(empty, fail, die, interrupt, then, both);
                let r = r.fold(empty, fail, die, interrupt, then, both);
                both(l, r)
            }
        }
    }

    /// Transform every typed failure, keeping the shape of the tree.
    pub fn map<E2, F>(self, mut f: F) -> Cause<E2>
    where
        F: FnMut(E) -> E2,
    {
        self.map_with(&mut f)
    }

    fn map_with<E2, F>(self, f: &mut F) -> Cause<E2>
    where
        F: FnMut(E) -> E2,
    {
        match self {
            Cause::Empty => Cause::Empty,
            Cause::Fail(e) => Cause::Fail(f(e)),
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Then(l, r) => {
                let l = l.map_with(f);
                Cause::Then(Box::new(l), Box::new(r.map_with(f)))
            }
            Cause::Both(l, r) => {
                let l = l.map_with(f);
                Cause::Both(Box::new(l), Box::new(r.map_with(f)))
            }
        }
    }

    /// Replace every typed failure with a whole cause.
    pub fn chain<E2, F>(self, mut f: F) -> Cause<E2>
    where
        F: FnMut(E) -> Cause<E2>,
    {
        self.chain_with(&mut f)
    }

    fn chain_with<E2, F>(self, f: &mut F) -> Cause<E2>
    where
        F: FnMut(E) -> Cause<E2>,
    {
        match self {
            Cause::Empty => Cause::Empty,
            Cause::Fail(e) => f(e),
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Then(l, r) => {
                let l = l.chain_with(f);
                l.then(r.chain_with(f))
            }
            Cause::Both(l, r) => {
                let l = l.chain_with(f);
                l.both(r.chain_with(f))
            }
        }
    }

    /// True when the tree holds no failure, defect or interruption.
    pub fn is_empty(&self) -> bool {
        self.find(|c| match c {
            Cause::Fail(_) | Cause::Die(_) | Cause::Interrupt(_) => Some(()),
            _ => None,
        })
        .is_none()
    }

    /// Whether the cause holds a typed failure.
    pub fn failed(&self) -> bool {
        self.find(|c| matches!(c, Cause::Fail(_)).then_some(())).is_some()
    }

    /// Whether the cause holds a defect.
    pub fn died(&self) -> bool {
        self.find(|c| matches!(c, Cause::Die(_)).then_some(())).is_some()
    }

    /// Whether the cause holds an interruption.
    pub fn interrupted(&self) -> bool {
        self.find(|c| matches!(c, Cause::Interrupt(_)).then_some(())).is_some()
    }

    /// Whether the cause holds interruptions and nothing else.
    pub fn interrupted_only(&self) -> bool {
        self.interrupted()
            && self
                .find(|c| matches!(c, Cause::Fail(_) | Cause::Die(_)).then_some(()))
                .is_none()
    }

    /// Every defect, in pre-order.
    pub fn defects(&self) -> Vec<Defect> {
        self.fold_left(Vec::new(), |acc, c| match c {
            Cause::Die(d) => {
                let mut next = acc.clone();
                next.push(d.clone());
                Some(next)
            }
            _ => None,
        })
    }

    /// Every interrupting fiber, deduplicated, in order of first appearance.
    pub fn interruptors(&self) -> Vec<FiberId> {
        let mut ids = Vec::new();
        let _ = self.find(|c| {
            if let Cause::Interrupt(id) = c {
                if !ids.contains(id) {
                    ids.push(*id);
                }
            }
            None::<()>
        });
        ids
    }

    /// The first defect.
    pub fn die_option(&self) -> Option<Defect> {
        self.find(|c| match c {
            Cause::Die(d) => Some(d.clone()),
            _ => None,
        })
    }

    /// The first interrupting fiber.
    pub fn interrupt_option(&self) -> Option<FiberId> {
        self.find(|c| match c {
            Cause::Interrupt(id) => Some(*id),
            _ => None,
        })
    }

    /// Drop every typed failure. Defects and interruptions survive.
    pub fn strip_failures<E2>(&self) -> Cause<E2> {
        match self {
            Cause::Empty | Cause::Fail(_) => Cause::Empty,
            Cause::Die(d) => Cause::Die(d.clone()),
            Cause::Interrupt(id) => Cause::Interrupt(*id),
            Cause::Then(l, r) => l.strip_failures().then(r.strip_failures()),
            Cause::Both(l, r) => l.strip_failures().both(r.strip_failures()),
        }
    }

    /// Keep only the defects, or `None` when there are none.
    pub fn keep_defects<E2>(&self) -> Option<Cause<E2>> {
        match self {
            Cause::Empty | Cause::Fail(_) | Cause::Interrupt(_) => None,
            Cause::Die(d) => Some(Cause::Die(d.clone())),
            Cause::Then(l, r) => match (l.keep_defects(), r.keep_defects()) {
                (Some(l), Some(r)) => Some(Cause::Then(Box::new(l), Box::new(r))),
                (Some(one), None) | (None, Some(one)) => Some(one),
                (None, None) => None,
            },
            Cause::Both(l, r) => match (l.keep_defects(), r.keep_defects()) {
                (Some(l), Some(r)) => Some(Cause::Both(Box::new(l), Box::new(r))),
                (Some(one), None) | (None, Some(one)) => Some(one),
                (None, None) => None,
            },
        }
    }

    /// Collapse the cause into a single defect.
    ///
    /// The first typed failure wins, mapped through `f`. Failing that, an
    /// interrupted cause becomes an [`InterruptedError`] naming the
    /// interruptors, and otherwise the first defect is returned.
    pub fn squash<F>(&self, f: F) -> Defect
    where
        F: FnOnce(&E) -> Defect,
    {
        if let Some(e) = self.find(|c| match c {
            Cause::Fail(e) => Some(e),
            _ => None,
        }) {
            return f(e);
        }
        if self.interrupted() {
            let ids: Vec<String> = self
                .interruptors()
                .iter()
                .map(|id| format!("#{}", id.as_u64()))
                .collect();
            return Defect::new(InterruptedError::new(format!(
                "Interrupted by fibers: {}",
                ids.join(", ")
            )));
        }
        self.die_option()
            .unwrap_or_else(|| Defect::new(InterruptedError::default()))
    }

    /// Render the cause as an indented tree.
    pub fn pretty(&self) -> String
    where
        E: fmt::Debug,
    {
        let mut out = String::new();
        self.render(&mut out, "", "");
        out
    }

    fn render(&self, out: &mut String, lead: &str, rest: &str)
    where
        E: fmt::Debug,
    {
        use std::fmt::Write;

        let (label, children) = match self {
            Cause::Empty => ("Empty".to_string(), None),
            Cause::Fail(e) => (format!("Fail: {e:?}"), None),
            Cause::Die(d) => (format!("Die: {d}"), None),
            Cause::Interrupt(id) => (format!("Interrupt: {id}"), None),
            Cause::Then(l, r) => ("Then".to_string(), Some((l, r))),
            Cause::Both(l, r) => ("Both".to_string(), Some((l, r))),
        };
        let _ = writeln!(out, "{lead}{label}");
        if let Some((l, r)) = children {
            l.render(out, &format!("{rest}├── "), &format!("{rest}│   "));
            r.render(out, &format!("{rest}└── "), &format!("{rest}    "));
        }
    }
}

impl<E: Clone> Cause<E> {
    /// Every typed failure, in pre-order.
    pub fn failures(&self) -> Vec<E> {
        self.fold_left(Vec::new(), |acc, c| match c {
            Cause::Fail(e) => {
                let mut next = acc.clone();
                next.push(e.clone());
                Some(next)
            }
            _ => None,
        })
    }

    /// The first typed failure.
    pub fn failure_option(&self) -> Option<E> {
        self.find(|c| match c {
            Cause::Fail(e) => Some(e.clone()),
            _ => None,
        })
    }

    /// The first typed failure, or the remaining cause when there is none.
    pub fn failure_or_cause(self) -> Result<E, Cause<Infallible>> {
        match self.failure_option() {
            Some(e) => Ok(e),
            None => Err(self.strip_failures()),
        }
    }

    /// Drop every interruption. Failures and defects survive.
    pub fn strip_interrupts(&self) -> Cause<E> {
        match self {
            Cause::Empty | Cause::Interrupt(_) => Cause::Empty,
            Cause::Fail(e) => Cause::Fail(e.clone()),
            Cause::Die(d) => Cause::Die(d.clone()),
            Cause::Then(l, r) => l.strip_interrupts().then(r.strip_interrupts()),
            Cause::Both(l, r) => l.strip_interrupts().both(r.strip_interrupts()),
        }
    }
}

impl<E: PartialEq> Cause<E> {
    /// Whether `that` appears as a subtree of this cause.
    pub fn contains(&self, that: &Cause<E>) -> bool {
        if let Cause::Empty = that {
            return true;
        }
        self.fold_left(false, |found, c| (!*found && c == that).then_some(true))
    }
}

impl Cause<Infallible> {
    /// Reinterpret a cause that cannot hold typed failures at any error type.
    pub fn widen<E>(self) -> Cause<E> {
        self.map(|never| match never {})
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pretty().trim_end())
    }
}

/// Pull a success out of a cause of `Result`s.
///
/// The first `Fail(Ok(a))` found in sequential or parallel position wins;
/// otherwise the `Err` payloads are kept as typed failures.
pub fn sequence_cause_either<A, E>(cause: Cause<Result<A, E>>) -> Result<A, Cause<E>> {
    match cause {
        Cause::Empty => Err(Cause::Empty),
        Cause::Fail(Ok(a)) => Ok(a),
        Cause::Fail(Err(e)) => Err(Cause::Fail(e)),
        Cause::Die(d) => Err(Cause::Die(d)),
        Cause::Interrupt(id) => Err(Cause::Interrupt(id)),
        Cause::Then(l, r) => match sequence_cause_either(*l) {
            Ok(a) => Ok(a),
            Err(l) => match sequence_cause_either(*r) {
                Ok(a) => Ok(a),
                Err(r) => Err(l.then(r)),
            },
        },
        Cause::Both(l, r) => match sequence_cause_either(*l) {
            Ok(a) => Ok(a),
            Err(l) => match sequence_cause_either(*r) {
                Ok(a) => Ok(a),
                Err(r) => Err(l.both(r)),
            },
        },
    }
}

/// Turn a cause of optional failures into an optional cause.
///
/// `Fail(None)` erases its branch; the whole result is `None` only when no
/// branch survives.
pub fn sequence_cause_option<E>(cause: Cause<Option<E>>) -> Option<Cause<E>> {
    match cause {
        Cause::Empty => Some(Cause::Empty),
        Cause::Fail(Some(e)) => Some(Cause::Fail(e)),
        Cause::Fail(None) => None,
        Cause::Die(d) => Some(Cause::Die(d)),
        Cause::Interrupt(id) => Some(Cause::Interrupt(id)),
        Cause::Then(l, r) => match (sequence_cause_option(*l), sequence_cause_option(*r)) {
            (Some(l), Some(r)) => Some(Cause::Then(Box::new(l), Box::new(r))),
            (Some(one), None) | (None, Some(one)) => Some(one),
            (None, None) => None,
        },
        Cause::Both(l, r) => match (sequence_cause_option(*l), sequence_cause_option(*r)) {
            (Some(l), Some(r)) => Some(Cause::Both(Box::new(l), Box::new(r))),
            (Some(one), None) | (None, Some(one)) => Some(one),
            (None, None) => None,
        },
    }
}

/// Borrowing variant of [`sequence_cause_option`]: builds the optional cause
/// from a shared tree without consuming it.
pub fn flip_cause_option<E: Clone>(cause: &Cause<Option<E>>) -> Option<Cause<E>> {
    fn merge<E>(
        l: Option<Cause<E>>,
        r: Option<Cause<E>>,
        join: fn(Cause<E>, Cause<E>) -> Cause<E>,
    ) -> Option<Cause<E>> {
        match (l, r) {
            (Some(l), Some(r)) => Some(join(l, r)),
            (one @ Some(_), None) | (None, one @ Some(_)) => one,
            (None, None) => None,
        }
    }
    cause.fold(
        &|| Some(Cause::Empty),
        &|e: &Option<E>| e.clone().map(Cause::Fail),
        &|d: &Defect| Some(Cause::Die(d.clone())),
        &|id| Some(Cause::Interrupt(id)),
        &|l, r| merge(l, r, |l, r| Cause::Then(Box::new(l), Box::new(r))),
        &|l, r| merge(l, r, |l, r| Cause::Both(Box::new(l), Box::new(r))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id(n: u64) -> FiberId {
        FiberId::new(n)
    }

    #[test]
    fn test_then_collapses_empty() {
        assert_eq!(Cause::empty().then(Cause::fail(1)), Cause::fail(1));
        assert_eq!(Cause::fail(1).then(Cause::empty()), Cause::fail(1));
        assert_eq!(Cause::<i32>::empty().both(Cause::empty()), Cause::Empty);
    }

    #[test]
    fn test_queries() {
        let cause = Cause::fail("e")
            .then(Cause::die(Defect::message("d")))
            .both(Cause::interrupt(id(7)));
        assert!(cause.failed());
        assert!(cause.died());
        assert!(cause.interrupted());
        assert!(!cause.interrupted_only());
        assert_eq!(cause.failures(), vec!["e"]);
        assert_eq!(cause.defects(), vec![Defect::message("d")]);
        assert_eq!(cause.interruptors(), vec![id(7)]);
    }

    #[test]
    fn test_interrupted_only() {
        let cause: Cause<()> = Cause::interrupt(id(1)).both(Cause::interrupt(id(2)));
        assert!(cause.interrupted_only());
        assert_eq!(cause.interruptors(), vec![id(1), id(2)]);
    }

    #[test]
    fn test_is_empty_with_nested_empties() {
        let cause: Cause<()> = Cause::Then(Box::new(Cause::Empty), Box::new(Cause::Empty));
        assert!(cause.is_empty());
        assert!(!Cause::<()>::interrupt(id(1)).is_empty());
    }

    #[test]
    fn test_find_on_empty_is_none() {
        let cause: Cause<i32> = Cause::Empty;
        assert_eq!(cause.find(|_| Some(1)), None);
    }

    #[test]
    fn test_find_is_left_to_right() {
        let cause = Cause::fail(1).both(Cause::fail(2));
        let first = cause.find(|c| match c {
            Cause::Fail(n) => Some(*n),
            _ => None,
        });
        assert_eq!(first, Some(1));
    }

    #[test]
    fn test_map_and_chain() {
        let cause = Cause::fail(2).then(Cause::interrupt(id(1)));
        assert_eq!(
            cause.clone().map(|n| n * 10),
            Cause::fail(20).then(Cause::interrupt(id(1)))
        );
        let chained: Cause<i32> = cause.chain(|_| Cause::empty());
        assert_eq!(chained, Cause::interrupt(id(1)));
    }

    #[test]
    fn test_strip_failures() {
        let cause = Cause::fail("x").then(Cause::die(Defect::message("d")));
        let stripped: Cause<&str> = cause.strip_failures();
        assert_eq!(stripped, Cause::die(Defect::message("d")));
    }

    #[test]
    fn test_keep_defects() {
        let cause = Cause::fail("x").both(Cause::interrupt(id(2)));
        assert_eq!(cause.keep_defects::<()>(), None);
        let cause = Cause::fail("x").then(Cause::die(Defect::message("d")));
        assert_eq!(cause.keep_defects::<()>(), Some(Cause::die(Defect::message("d"))));
    }

    #[test]
    fn test_squash_prefers_failure() {
        let cause = Cause::die(Defect::message("d")).then(Cause::fail("typed"));
        assert_eq!(cause.squash(|e| Defect::message(*e)).to_string(), "typed");
    }

    #[test]
    fn test_squash_interruption_message() {
        let cause: Cause<()> = Cause::interrupt(id(1)).both(Cause::interrupt(id(2)));
        let defect = cause.squash(|_| Defect::message("unused"));
        assert!(defect.is_interruption());
        assert_eq!(defect.to_string(), "Interrupted by fibers: #1, #2");
    }

    #[test]
    fn test_squash_empty() {
        let defect = Cause::<()>::empty().squash(|_| Defect::message("unused"));
        assert_eq!(defect.to_string(), "Interrupted");
    }

    #[test]
    fn test_failure_or_cause() {
        assert_eq!(Cause::fail(3).failure_or_cause(), Ok(3));
        let cause: Cause<i32> = Cause::interrupt(id(4));
        assert_eq!(cause.failure_or_cause(), Err(Cause::interrupt(id(4))));
    }

    #[test]
    fn test_contains() {
        let cause = Cause::fail(1).then(Cause::interrupt(id(9)));
        assert!(cause.contains(&Cause::interrupt(id(9))));
        assert!(cause.contains(&Cause::empty()));
        assert!(!cause.contains(&Cause::interrupt(id(8))));
    }

    #[test]
    fn test_sequence_cause_either() {
        assert_eq!(sequence_cause_either::<i32, &str>(Cause::Empty), Err(Cause::Empty));
        assert_eq!(sequence_cause_either::<i32, &str>(Cause::fail(Ok(5))), Ok(5));
        let mixed = Cause::fail(Err("e")).then(Cause::fail(Ok(6)));
        assert_eq!(sequence_cause_either(mixed), Ok(6));
        let errs: Cause<Result<i32, &str>> = Cause::fail(Err("a")).both(Cause::fail(Err("b")));
        assert_eq!(
            sequence_cause_either(errs),
            Err(Cause::fail("a").both(Cause::fail("b")))
        );
    }

    #[test]
    fn test_flip_cause_option_matches_sequence() {
        let cause = Cause::fail(None).then(Cause::fail(Some(3))).both(Cause::interrupt(id(4)));
        assert_eq!(flip_cause_option(&cause), sequence_cause_option(cause.clone()));
        assert_eq!(flip_cause_option::<i32>(&Cause::fail(None)), None);
    }

    #[test]
    fn test_sequence_cause_option() {
        assert_eq!(sequence_cause_option::<i32>(Cause::Empty), Some(Cause::Empty));
        assert_eq!(sequence_cause_option::<i32>(Cause::fail(None)), None);
        let cause = Cause::fail(None).then(Cause::fail(Some(2)));
        assert_eq!(sequence_cause_option(cause), Some(Cause::fail(2)));
        let cause: Cause<Option<i32>> = Cause::fail(None).both(Cause::fail(None));
        assert_eq!(sequence_cause_option(cause), None);
    }

    #[test]
    fn test_pretty_tree() {
        let cause = Cause::fail("boom").then(Cause::interrupt(id(3)));
        assert_eq!(
            cause.to_string(),
            "Then\n├── Fail: \"boom\"\n└── Interrupt: Fiber(3)"
        );
    }

    #[test]
    fn test_widen() {
        let cause: Cause<Infallible> = Cause::interrupt(id(1));
        let wide: Cause<String> = cause.widen();
        assert_eq!(wide, Cause::interrupt(id(1)));
    }
}
