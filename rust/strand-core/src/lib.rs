//! Strand Core
//!
//! Pure data shared by the runtime and its collaborators: fiber identity,
//! defects, the [`Cause`] failure algebra and terminal [`Exit`] values.

pub mod cause;
pub mod defect;
pub mod exit;
pub mod fiber_id;

pub use cause::Cause;
pub use defect::{Defect, DefectKind};
pub use exit::{combine_finalizer_exit, Exit, Halt};
pub use fiber_id::FiberId;
