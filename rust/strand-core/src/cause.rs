//! The failure algebra.
//!
//! A [`Cause`] is a tree describing *why* a computation did not produce a
//! value. Leaves distinguish expected failures ([`Cause::Fail`]), defects
//! ([`Cause::Die`]) and cooperative cancellation ([`Cause::Interrupt`]).
//! Inner nodes record how several failures relate:
//!
//! | Node         | Meaning                                                   |
//! |--------------|-----------------------------------------------------------|
//! | `Then(l, r)` | `l` happened, then `r` (e.g. a finalizer failed after `l`) |
//! | `Both(l, r)` | `l` and `r` happened concurrently, no defined order        |
//!
//! # Invariants
//!
//! 1. No combinator drops a leaf. [`Cause::then`] and [`Cause::both`] only
//!    elide [`Cause::Empty`], which is their unit.
//! 2. `Then` is associative; `Both` is associative and, for reporting,
//!    commutative. Queries such as [`Cause::failures`] walk left to right.
//!
//! # Interrupt vs. failure precedence
//!
//! A cause may contain both a typed failure and an interruption, e.g.
//! `Both(Fail(e), Interrupt(id))`. Recovery always prefers the typed failure:
//! [`Cause::failure_or_cause`] returns `e`. Such a cause still reports
//! [`Cause::is_interrupted`] as `true`, and [`Cause::is_interrupted_only`] as
//! `false`. The interpreter keeps interruption sticky on the fiber itself, so
//! preferring the failure here never hides a real cancellation.

use crate::defect::Defect;
use crate::fiber_id::FiberId;
use std::collections::BTreeSet;
use std::fmt;

// ---------------------------------------------------------------------------
// Cause
// ---------------------------------------------------------------------------

/// A tree describing how a computation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause<E> {
    /// No failure. Unit of [`Cause::then`] and [`Cause::both`].
    Empty,
    /// An expected, typed, recoverable failure.
    Fail(E),
    /// An unexpected failure (a bug).
    Die(Defect),
    /// Cooperative cancellation requested by the given fiber.
    Interrupt(FiberId),
    /// Sequential composition: the left cause happened before the right.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Concurrent composition: both causes happened, in no defined order.
    Both(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
    /// A typed failure.
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    /// A defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Cause::Die(defect.into())
    }

    /// An interruption requested by `by`.
    pub fn interrupt(by: FiberId) -> Self {
        Cause::Interrupt(by)
    }

    /// Sequential composition, eliding [`Cause::Empty`] on either side.
    pub fn then(left: Cause<E>, right: Cause<E>) -> Self {
        match (left, right) {
            (Cause::Empty, right) => right,
            (left, Cause::Empty) => left,
            (left, right) => Cause::Then(Box::new(left), Box::new(right)),
        }
    }

    /// Concurrent composition, eliding [`Cause::Empty`] on either side.
    pub fn both(left: Cause<E>, right: Cause<E>) -> Self {
        match (left, right) {
            (Cause::Empty, right) => right,
            (left, Cause::Empty) => left,
            (left, right) => Cause::Both(Box::new(left), Box::new(right)),
        }
    }

    // -- queries ----------------------------------------------------------

    /// Visit every leaf, left to right, without recursion.
    fn for_each_leaf<'a>(&'a self, mut visit: impl FnMut(&'a Cause<E>)) {
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            match node {
                Cause::Then(left, right) | Cause::Both(left, right) => {
                    pending.push(right);
                    pending.push(left);
                }
                leaf => visit(leaf),
            }
        }
    }

    /// `true` when the tree contains no failure at all.
    pub fn is_empty(&self) -> bool {
        let mut empty = true;
        self.for_each_leaf(|leaf| {
            if !matches!(leaf, Cause::Empty) {
                empty = false;
            }
        });
        empty
    }

    /// Number of non-empty leaves.
    pub fn size(&self) -> usize {
        let mut count = 0;
        self.for_each_leaf(|leaf| {
            if !matches!(leaf, Cause::Empty) {
                count += 1;
            }
        });
        count
    }

    /// All typed failures, left to right.
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.for_each_leaf(|leaf| {
            if let Cause::Fail(e) = leaf {
                out.push(e);
            }
        });
        out
    }

    /// All defects, left to right.
    pub fn defects(&self) -> Vec<&Defect> {
        let mut out = Vec::new();
        self.for_each_leaf(|leaf| {
            if let Cause::Die(d) = leaf {
                out.push(d);
            }
        });
        out
    }

    /// The set of fibers that requested an interruption recorded here.
    pub fn interruptors(&self) -> BTreeSet<FiberId> {
        let mut out = BTreeSet::new();
        self.for_each_leaf(|leaf| {
            if let Cause::Interrupt(id) = leaf {
                out.insert(*id);
            }
        });
        out
    }

    /// The leftmost typed failure, if any.
    pub fn first_failure(&self) -> Option<&E> {
        self.failures().into_iter().next()
    }

    /// Whether any typed failure is present.
    pub fn is_failure(&self) -> bool {
        self.first_failure().is_some()
    }

    /// Whether any defect is present.
    pub fn is_die(&self) -> bool {
        !self.defects().is_empty()
    }

    /// Whether any interruption is present.
    pub fn is_interrupted(&self) -> bool {
        !self.interruptors().is_empty()
    }

    /// Whether the cause consists of interruptions only.
    pub fn is_interrupted_only(&self) -> bool {
        let mut saw_interrupt = false;
        let mut only = true;
        self.for_each_leaf(|leaf| match leaf {
            Cause::Interrupt(_) => saw_interrupt = true,
            Cause::Empty => {}
            _ => only = false,
        });
        saw_interrupt && only
    }

    /// Whether `other` occurs as a subtree of this cause.
    pub fn contains(&self, other: &Cause<E>) -> bool
    where
        E: PartialEq,
    {
        if other.is_empty() {
            return true;
        }
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            if node == other {
                return true;
            }
            if let Cause::Then(left, right) | Cause::Both(left, right) = node {
                pending.push(right);
                pending.push(left);
            }
        }
        false
    }

    // -- transforms -------------------------------------------------------

    /// Take the leftmost typed failure, or give the cause back when it holds
    /// none. This is the recovery point used by `catch_all`.
    pub fn failure_or_cause(self) -> Result<E, Cause<E>> {
        if !self.is_failure() {
            return Err(self);
        }
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            match node {
                Cause::Fail(e) => return Ok(e),
                Cause::Then(left, right) | Cause::Both(left, right) => {
                    pending.push(*right);
                    pending.push(*left);
                }
                _ => {}
            }
        }
        unreachable_failure()
    }

    /// Transform every typed failure.
    pub fn map<E2>(self, mut f: impl FnMut(E) -> E2) -> Cause<E2> {
        self.flat_map_fail(&mut |e| Cause::Fail(f(e)))
    }

    /// Replace every typed failure with an arbitrary cause.
    pub fn flat_map_fail<E2>(self, f: &mut impl FnMut(E) -> Cause<E2>) -> Cause<E2> {
        match self {
            Cause::Empty => Cause::Empty,
            Cause::Fail(e) => f(e),
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Then(left, right) => {
                let left = left.flat_map_fail(f);
                Cause::then(left, right.flat_map_fail(f))
            }
            Cause::Both(left, right) => {
                let left = left.flat_map_fail(f);
                Cause::both(left, right.flat_map_fail(f))
            }
        }
    }

    /// Drop typed failures, keeping defects and interruptions.
    pub fn strip_failures(self) -> Cause<E> {
        self.flat_map_fail(&mut |_| Cause::Empty)
    }
}

/// `failure_or_cause` only walks trees that were checked to hold a failure.
#[cold]
fn unreachable_failure<E>() -> Result<E, Cause<E>> {
    Err(Cause::die(Defect::runtime("cause reported a failure it does not hold")))
}

impl<E: fmt::Display> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Empty => write!(f, "Empty"),
            Cause::Fail(e) => write!(f, "Fail({e})"),
            Cause::Die(d) => write!(f, "Die({d})"),
            Cause::Interrupt(id) => write!(f, "Interrupt({id})"),
            Cause::Then(left, right) => write!(f, "({left} ; {right})"),
            Cause::Both(left, right) => write!(f, "({left} | {right})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
