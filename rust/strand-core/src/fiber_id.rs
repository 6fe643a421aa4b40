//! Fiber identity.
//!
//! Every fiber gets a [`FiberId`] when it is created. Ids are handed out from a
//! global atomic counter, so they are unique for the lifetime of the process
//! and order fibers by creation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// FiberId
// ---------------------------------------------------------------------------

/// Counter used to mint [`FiberId`]s. Zero is reserved for [`FiberId::NONE`].
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// A unique, opaque identifier for a fiber.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    /// The id used for operations performed outside of any fiber, e.g. an
    /// interruption requested by the host thread.
    pub const NONE: FiberId = FiberId(0);

    /// Allocate the next unique fiber id.
    pub fn next() -> Self {
        Self(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Return the raw numeric value (useful for logging / tracing).
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this is [`FiberId::NONE`].
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({})", self.0)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "fiber:none")
        } else {
            write!(f, "fiber:{}", self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
