//! Terminal outcomes.
//!
//! An [`Exit`] is what a fiber produces when it finishes: either the success
//! value or a [`Halt`]. A halt carries the primary [`Cause`] plus an ordered
//! list of *remaining* causes: failures that happened alongside the primary
//! outcome (typically in finalizers) and must not be lost.
//!
//! [`combine_finalizer_exit`] is the single rule used to merge the outcome of
//! an action with the outcome of its cleanup.

use crate::cause::Cause;
use crate::defect::Defect;
use crate::fiber_id::FiberId;

// ---------------------------------------------------------------------------
// Halt
// ---------------------------------------------------------------------------

/// The failure half of an [`Exit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Halt<E> {
    /// The cause surfaced to error handlers.
    pub cause: Cause<E>,
    /// Supplementary causes, oldest first.
    pub remaining: Vec<Cause<E>>,
}

impl<E> Halt<E> {
    /// A halt with no supplementary causes.
    pub fn new(cause: Cause<E>) -> Self {
        Self {
            cause,
            remaining: Vec::new(),
        }
    }

    /// Record a supplementary cause. Empty causes are not recorded.
    pub fn with_remaining(mut self, cause: Cause<E>) -> Self {
        if !cause.is_empty() {
            self.remaining.push(cause);
        }
        self
    }

    /// Append another halt: its primary cause first, then its own remaining
    /// causes, so nothing it carried is lost.
    pub fn append(mut self, other: Halt<E>) -> Self {
        self = self.with_remaining(other.cause);
        self.remaining
            .extend(other.remaining.into_iter().filter(|c| !c.is_empty()));
        self
    }

    /// Primary cause followed by the remaining ones.
    pub fn causes(&self) -> impl Iterator<Item = &Cause<E>> {
        std::iter::once(&self.cause).chain(self.remaining.iter())
    }

    /// Fold everything into a single sequential cause.
    pub fn into_cause(self) -> Cause<E> {
        self.remaining
            .into_iter()
            .fold(self.cause, |acc, next| Cause::then(acc, next))
    }

    /// Whether the primary cause records an interruption.
    pub fn is_interrupted(&self) -> bool {
        self.cause.is_interrupted()
    }

    /// Transform every typed failure, in every cause.
    pub fn map<E2>(self, mut f: impl FnMut(E) -> E2) -> Halt<E2> {
        self.flat_map_fail(&mut |e| Cause::Fail(f(e)))
    }

    /// Replace every typed failure, in every cause.
    pub fn flat_map_fail<E2>(self, f: &mut impl FnMut(E) -> Cause<E2>) -> Halt<E2> {
        Halt {
            cause: self.cause.flat_map_fail(f),
            remaining: self
                .remaining
                .into_iter()
                .map(|c| c.flat_map_fail(f))
                .collect(),
        }
    }
}

impl<E> From<Cause<E>> for Halt<E> {
    fn from(cause: Cause<E>) -> Self {
        Halt::new(cause)
    }
}

// ---------------------------------------------------------------------------
// Exit
// ---------------------------------------------------------------------------

/// How a computation terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit<E, A> {
    /// Completed with a value.
    Done(A),
    /// Terminated by a failure tree.
    Halt(Halt<E>),
}

impl<E, A> Exit<E, A> {
    /// A successful exit.
    pub fn done(value: A) -> Self {
        Exit::Done(value)
    }

    /// An exit halted by the given cause.
    pub fn from_cause(cause: Cause<E>) -> Self {
        Exit::Halt(Halt::new(cause))
    }

    /// An exit halted by a typed failure.
    pub fn fail(error: E) -> Self {
        Exit::from_cause(Cause::Fail(error))
    }

    /// An exit halted by a defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Exit::from_cause(Cause::die(defect))
    }

    /// An exit halted by an interruption requested by `by`.
    pub fn interrupt(by: FiberId) -> Self {
        Exit::from_cause(Cause::Interrupt(by))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Exit::Done(_))
    }

    pub fn is_halt(&self) -> bool {
        matches!(self, Exit::Halt(_))
    }

    /// Whether the primary cause records an interruption.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Exit::Halt(h) if h.is_interrupted())
    }

    pub fn as_done(&self) -> Option<&A> {
        match self {
            Exit::Done(a) => Some(a),
            Exit::Halt(_) => None,
        }
    }

    pub fn as_halt(&self) -> Option<&Halt<E>> {
        match self {
            Exit::Done(_) => None,
            Exit::Halt(h) => Some(h),
        }
    }

    /// The primary cause, if halted.
    pub fn cause(&self) -> Option<&Cause<E>> {
        self.as_halt().map(|h| &h.cause)
    }

    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<E, B> {
        match self {
            Exit::Done(a) => Exit::Done(f(a)),
            Exit::Halt(h) => Exit::Halt(h),
        }
    }

    pub fn map_err<E2>(self, f: impl FnMut(E) -> E2) -> Exit<E2, A> {
        match self {
            Exit::Done(a) => Exit::Done(a),
            Exit::Halt(h) => Exit::Halt(h.map(f)),
        }
    }

    /// Borrowing view with the value discarded. Used to hand an outcome to
    /// finalizers that must not consume it.
    pub fn as_unit(&self) -> Exit<E, ()>
    where
        E: Clone,
    {
        match self {
            Exit::Done(_) => Exit::Done(()),
            Exit::Halt(h) => Exit::Halt(h.clone()),
        }
    }

    pub fn into_result(self) -> Result<A, Halt<E>> {
        match self {
            Exit::Done(a) => Ok(a),
            Exit::Halt(h) => Err(h),
        }
    }
}

impl<E, A> From<Result<A, E>> for Exit<E, A> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Exit::Done(a),
            Err(e) => Exit::fail(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Finalizer combination
// ---------------------------------------------------------------------------

/// Merge the exit of an action (`primary`) with the exit of its cleanup
/// (`secondary`).
///
/// | primary      | secondary | result                       |
/// |--------------|-----------|------------------------------|
/// | `Done(v)`    | `Done(_)` | `Done(v)`                    |
/// | `Done(_)`    | `Halt(c)` | `Halt(c)`                    |
/// | `Halt(c)`    | `Done(_)` | `Halt(c)` unchanged          |
/// | `Halt(c, R)` | `Halt(c2)`| `Halt(c, R ++ [c2, ...])`    |
///
/// A successful action cannot mask a cleanup failure, and a cleanup failure
/// never replaces the action's own failure.
pub fn combine_finalizer_exit<E, A, B>(primary: Exit<E, A>, secondary: Exit<E, B>) -> Exit<E, A> {
    match (primary, secondary) {
        (Exit::Done(a), Exit::Done(_)) => Exit::Done(a),
        (Exit::Done(_), Exit::Halt(h)) => Exit::Halt(h),
        (Exit::Halt(h), Exit::Done(_)) => Exit::Halt(h),
        (Exit::Halt(h), Exit::Halt(h2)) => Exit::Halt(h.append(h2)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
