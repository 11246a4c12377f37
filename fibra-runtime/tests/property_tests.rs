//! Property-based tests for the fibra runtime.
//!
//! Uses proptest to generate random causes and effects and checks the
//! algebraic laws they are expected to satisfy.

use std::time::Duration;

use fibra_runtime::prelude::*;
use proptest::prelude::*;

/// Strategy for leaf causes
fn leaf() -> impl Strategy<Value = Cause<u8>> {
    prop_oneof![
        Just(Cause::empty()),
        any::<u8>().prop_map(Cause::fail),
        (1u64..64).prop_map(|n| Cause::interrupt(FiberId::new(n))),
        "[a-z]{1,6}".prop_map(|m| Cause::die(Defect::message(m))),
    ]
}

/// Strategy for cause trees built through the public constructors
fn cause() -> impl Strategy<Value = Cause<u8>> {
    leaf().prop_recursive(4, 32, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(l, r)| l.then(r)),
            (inner.clone(), inner).prop_map(|(l, r)| l.both(r)),
        ]
    })
}

/// Strategy for effects that either succeed or fail
fn outcome() -> impl Strategy<Value = Result<i32, String>> {
    prop_oneof![
        any::<i32>().prop_map(Ok),
        "[a-z]{1,4}".prop_map(Err),
    ]
}

fn lift(outcome: Result<i32, String>) -> Effect<(), String, i32> {
    match outcome {
        Ok(n) => succeed(n),
        Err(e) => fail(e),
    }
}

fn half(n: i32) -> Effect<(), String, i32> {
    if n % 2 == 0 {
        succeed(n / 2)
    } else {
        fail(format!("odd {n}"))
    }
}

fn runtime() -> Runtime {
    Runtime::new(
        RuntimeConfig::builder()
            .num_workers(1)
            .default_timeout(Some(Duration::from_secs(10)))
            .build_unchecked(),
    )
}

proptest! {
    /// Empty is the identity of both compositions
    #[test]
    fn cause_empty_is_identity(c in cause()) {
        prop_assert_eq!(Cause::empty().then(c.clone()), c.clone());
        prop_assert_eq!(c.clone().then(Cause::empty()), c.clone());
        prop_assert_eq!(Cause::empty().both(c.clone()), c.clone());
        prop_assert_eq!(c.clone().both(Cause::empty()), c);
    }

    /// Failures are collected left to right across a sequential composition
    #[test]
    fn cause_failures_are_ordered(left in cause(), right in cause()) {
        let mut expected = left.failures();
        expected.extend(right.failures());
        prop_assert_eq!(left.then(right).failures(), expected);
    }

    /// The first failure found is the first one collected
    #[test]
    fn cause_failure_option_matches_failures(c in cause()) {
        prop_assert_eq!(c.failure_option(), c.failures().first().copied());
        prop_assert_eq!(c.failed(), !c.failures().is_empty());
    }

    /// Predicates agree with the collected leaves
    #[test]
    fn cause_predicates_agree(c in cause()) {
        prop_assert_eq!(c.died(), !c.defects().is_empty());
        prop_assert_eq!(c.interrupted(), !c.interruptors().is_empty());
    }

    /// Stripping failures keeps defects and interruptions
    #[test]
    fn cause_strip_failures_keeps_the_rest(c in cause()) {
        let stripped: Cause<u8> = c.strip_failures();
        prop_assert!(!stripped.failed());
        prop_assert_eq!(stripped.defects(), c.defects());
        prop_assert_eq!(stripped.interruptors(), c.interruptors());
    }

    /// Mapping transforms every failure and nothing else
    #[test]
    fn cause_map_transforms_failures(c in cause()) {
        let expected: Vec<u16> = c.failures().into_iter().map(|e| u16::from(e) + 1).collect();
        let mapped = c.clone().map(|e| u16::from(e) + 1);
        prop_assert_eq!(mapped.failures(), expected);
        prop_assert_eq!(mapped.defects(), c.defects());
    }

    /// An empty cause finds nothing; a bare failure finds itself
    #[test]
    fn cause_find_on_leaves(e in any::<u8>()) {
        let empty: Cause<u8> = Cause::empty();
        prop_assert_eq!(empty.find(|_| Some(())), None);
        let failed = Cause::fail(e);
        let found = failed.find(|c| match c {
            Cause::Fail(x) => Some(*x),
            _ => None,
        });
        prop_assert_eq!(found, Some(e));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// `succeed(a).chain(f)` behaves like `f(a)`
    #[test]
    fn effect_left_identity(a in any::<i32>()) {
        let runtime = runtime();
        prop_assert_eq!(
            runtime.run(succeed::<(), String, i32>(a).chain(half)),
            runtime.run(half(a))
        );
    }

    /// `m.chain(succeed)` behaves like `m`
    #[test]
    fn effect_right_identity(o in outcome()) {
        let runtime = runtime();
        prop_assert_eq!(
            runtime.run(lift(o.clone()).chain(succeed)),
            runtime.run(lift(o))
        );
    }

    /// Chaining is associative
    #[test]
    fn effect_associativity(o in outcome()) {
        let runtime = runtime();
        let nested = lift(o.clone()).chain(half).chain(half);
        let flat = lift(o).chain(|n| half(n).chain(half));
        prop_assert_eq!(runtime.run(nested), runtime.run(flat));
    }

    /// `either` reflects the outcome into the success channel
    #[test]
    fn effect_either_reflects(o in outcome()) {
        let runtime = runtime();
        prop_assert_eq!(
            runtime.run(lift(o.clone()).either::<Never>()),
            Exit::succeed(o)
        );
    }

    /// Sequential and parallel traversal keep the input order
    #[test]
    fn effect_foreach_keeps_order(items in prop::collection::vec(any::<i32>(), 0..16)) {
        let runtime = runtime();
        let sequential = foreach(items.clone(), succeed::<(), Never, i32>);
        let parallel = foreach_par(items.clone(), succeed::<(), Never, i32>);
        prop_assert_eq!(runtime.run(sequential), Exit::succeed(items.clone()));
        prop_assert_eq!(runtime.run(parallel), Exit::succeed(items));
    }

    /// Every finalizer still registered at close runs exactly once, in
    /// registration order; denied ones never run
    #[test]
    fn scope_runs_each_finalizer_once(denied in prop::collection::vec(any::<bool>(), 0..12)) {
        let runtime = runtime();
        let scope: Scope<()> = Scope::make();
        let log = Ref::new(Vec::new());
        let mut expected = Vec::new();
        for (index, deny) in denied.iter().enumerate() {
            let entries = log.clone();
            let ensured = scope.ensure(move |_| {
                entries.update(move |mut v: Vec<usize>| {
                    v.push(index);
                    v
                })
            });
            match ensured {
                fibra_runtime::Ensured::Registered(key) if *deny => {
                    prop_assert!(scope.deny(&key));
                }
                fibra_runtime::Ensured::Registered(_) => expected.push(index),
                fibra_runtime::Ensured::Closed(_) => prop_assert!(false, "scope closed early"),
            }
        }

        prop_assert_eq!(runtime.run(scope.close(())), Exit::succeed(true));
        prop_assert_eq!(runtime.run(scope.close(())), Exit::succeed(false));
        prop_assert_eq!(log.unsafe_get(), expected);
    }
}
