//! Property-based tests for the failure algebra.
//!
//! ## Properties Verified
//!
//! - `Empty` is the identity of `then` and `both`
//! - `then` / `both` never add or drop leaves
//! - `then` is associative with respect to leaf order
//! - `combine_finalizer_exit` keeps every cause of both inputs

use proptest::prelude::*;
use strand_core::{combine_finalizer_exit, Cause, Defect, Exit, FiberId, Halt};

// ============================================================================
// Strategies
// ============================================================================

fn arb_leaf() -> impl Strategy<Value = Cause<u8>> {
    prop_oneof![
        Just(Cause::Empty),
        any::<u8>().prop_map(Cause::Fail),
        "[a-z]{1,6}".prop_map(|m| Cause::Die(Defect::new(m))),
        any::<bool>().prop_map(|outside| {
            Cause::Interrupt(if outside { FiberId::NONE } else { FiberId::next() })
        }),
    ]
}

fn arb_cause() -> impl Strategy<Value = Cause<u8>> {
    arb_leaf().prop_recursive(4, 32, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(l, r)| Cause::then(l, r)),
            (inner.clone(), inner).prop_map(|(l, r)| Cause::both(l, r)),
        ]
    })
}

fn arb_exit() -> impl Strategy<Value = Exit<u8, u8>> {
    prop_oneof![
        any::<u8>().prop_map(Exit::Done),
        (arb_cause(), prop::collection::vec(arb_cause(), 0..3)).prop_map(|(c, rest)| {
            Exit::Halt(
                rest.into_iter()
                    .fold(Halt::new(c), |halt, next| halt.with_remaining(next)),
            )
        }),
    ]
}

/// Leaves rendered to strings, sorted, as a multiset signature.
fn leaves(cause: &Cause<u8>) -> Vec<String> {
    let mut out: Vec<String> = cause
        .failures()
        .into_iter()
        .map(|e| format!("fail:{e}"))
        .chain(cause.defects().into_iter().map(|d| format!("die:{d}")))
        .collect();
    out.push(format!("interrupts:{}", cause.interruptors().len()));
    out.sort();
    out
}

fn exit_failures(exit: &Exit<u8, u8>) -> Vec<u8> {
    let mut out: Vec<u8> = match exit {
        Exit::Done(_) => Vec::new(),
        Exit::Halt(h) => h
            .causes()
            .flat_map(|c| c.failures().into_iter().copied())
            .collect(),
    };
    out.sort();
    out
}

// ============================================================================
// Identity
// ============================================================================

proptest! {
    #[test]
    fn prop_empty_is_identity_of_then(c in arb_cause()) {
        prop_assert_eq!(Cause::then(Cause::Empty, c.clone()), c.clone());
        prop_assert_eq!(Cause::then(c.clone(), Cause::Empty), c);
    }

    #[test]
    fn prop_empty_is_identity_of_both(c in arb_cause()) {
        prop_assert_eq!(Cause::both(Cause::Empty, c.clone()), c.clone());
        prop_assert_eq!(Cause::both(c.clone(), Cause::Empty), c);
    }
}

// ============================================================================
// Leaf preservation
// ============================================================================

proptest! {
    #[test]
    fn prop_then_preserves_leaf_count(a in arb_cause(), b in arb_cause()) {
        prop_assert_eq!(Cause::then(a.clone(), b.clone()).size(), a.size() + b.size());
    }

    #[test]
    fn prop_both_preserves_leaf_count(a in arb_cause(), b in arb_cause()) {
        prop_assert_eq!(Cause::both(a.clone(), b.clone()).size(), a.size() + b.size());
    }

    #[test]
    fn prop_both_is_commutative_for_reporting(a in arb_cause(), b in arb_cause()) {
        let ab = Cause::both(a.clone(), b.clone());
        let ba = Cause::both(b, a);
        prop_assert_eq!(leaves(&ab), leaves(&ba));
    }

    #[test]
    fn prop_then_is_associative_in_leaf_order(
        a in arb_cause(),
        b in arb_cause(),
        c in arb_cause()
    ) {
        let left = Cause::then(Cause::then(a.clone(), b.clone()), c.clone());
        let right = Cause::then(a, Cause::then(b, c));
        prop_assert_eq!(left.failures(), right.failures());
        prop_assert_eq!(left.defects(), right.defects());
    }

    #[test]
    fn prop_strip_failures_keeps_defects_and_interrupts(c in arb_cause()) {
        let stripped = c.clone().strip_failures();
        prop_assert!(!stripped.is_failure());
        prop_assert_eq!(stripped.defects().len(), c.defects().len());
        prop_assert_eq!(stripped.interruptors(), c.interruptors());
    }
}

// ============================================================================
// Finalizer combination
// ============================================================================

proptest! {
    #[test]
    fn prop_combine_never_drops_failures(p in arb_exit(), s in arb_exit()) {
        let mut expected = exit_failures(&p);
        expected.extend(exit_failures(&s));
        expected.sort();

        let combined = combine_finalizer_exit(p.clone(), s);
        prop_assert_eq!(exit_failures(&combined), expected);
        if p.is_halt() {
            prop_assert_eq!(combined.cause(), p.cause());
        }
    }

    #[test]
    fn prop_combine_with_done_secondary_is_identity(p in arb_exit(), v in any::<u8>()) {
        prop_assert_eq!(combine_finalizer_exit(p.clone(), Exit::<u8, u8>::Done(v)), p);
    }
}
