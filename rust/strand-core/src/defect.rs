//! Defects: unexpected failures.
//!
//! A defect is the runtime's rendition of a "thrown value". Panics raised by
//! user code are caught at the interpreter boundary and converted into a
//! [`Defect`] so they travel through the [`Cause`](crate::Cause) algebra as
//! data instead of unwinding through the scheduler.
//!
//! # Policy
//!
//! - **Typed failures** (`Cause::Fail`) are expected and recoverable.
//! - **Defects** (`Cause::Die`) are bugs: a panicking thunk, a violated
//!   invariant, or an explicit `die`. They are reported, not recovered from,
//!   unless a handler deliberately inspects the whole cause.

use std::any::Any;
use std::fmt;

// ---------------------------------------------------------------------------
// DefectKind
// ---------------------------------------------------------------------------

/// Where a defect came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefectKind {
    /// A panic caught at the interpreter boundary.
    Panic,
    /// Raised explicitly (e.g. `Effect::die`, or a typed error promoted with
    /// `or_die`).
    Explicit,
    /// An internal runtime invariant did not hold.
    Runtime,
}

// ---------------------------------------------------------------------------
// Defect
// ---------------------------------------------------------------------------

/// An unexpected failure.
///
/// The original panic payload is inspected and, where possible, its message
/// is extracted as a `String`. Two defects compare equal when both kind and
/// message match, which keeps `Exit` values structurally comparable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Defect {
    kind: DefectKind,
    message: String,
}

impl Defect {
    /// An explicit defect with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: DefectKind::Explicit,
            message: message.into(),
        }
    }

    /// A defect describing a broken runtime invariant.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            kind: DefectKind::Runtime,
            message: message.into(),
        }
    }

    /// Build a defect from a raw panic payload (`Box<dyn Any>`).
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self {
            kind: DefectKind::Panic,
            message: panic_message(payload.as_ref()),
        }
    }

    /// Return the defect message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Return where the defect came from.
    pub fn kind(&self) -> DefectKind {
        self.kind
    }

    fn kind_label(&self) -> &'static str {
        match self.kind {
            DefectKind::Panic => "panic",
            DefectKind::Explicit => "defect",
            DefectKind::Runtime => "runtime defect",
        }
    }
}

/// Extract a human-readable message from a panic payload.
///
/// Handles `&str` and `String` payloads; falls back to a generic message.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl From<&str> for Defect {
    fn from(message: &str) -> Self {
        Defect::new(message)
    }
}

impl From<String> for Defect {
    fn from(message: String) -> Self {
        Defect::new(message)
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind_label(), self.message)
    }
}

impl std::error::Error for Defect {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
