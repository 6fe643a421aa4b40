//! Strand Runtime
//!
//! An effect system: programs are described as [`Effect`] values and run by
//! a [`Runtime`] on lightweight fibers multiplexed onto a fixed worker pool.
//!
//! ```ignore
//! use strand_rt::prelude::*;
//!
//! let runtime = Runtime::new(RuntimeConfig::default())?;
//! let exit = runtime.run(Effect::<(), String, i32>::succeed(42), ());
//! assert_eq!(exit, Exit::done(42));
//! ```

pub mod config;
pub mod effect;
pub mod fiber;
pub mod managed;
pub mod queue;
pub mod ref_cell;
pub mod runtime;
pub mod scheduler;
pub mod timer;

pub use config::{ConfigError, RuntimeConfig};
pub use effect::{BackoffStrategy, Canceler, Effect, Restore, Resume, RetryPolicy};
pub use fiber::Fiber;
pub use managed::{Finalizer, Leak, Managed, Reservation};
pub use queue::{Queue, QueueError};
pub use ref_cell::Ref;
pub use runtime::{Runtime, RuntimeError};

pub mod prelude {
    pub use crate::{
        BackoffStrategy, Effect, Fiber, Leak, Managed, Queue, Ref, RetryPolicy, Runtime,
        RuntimeConfig,
    };
    pub use strand_core::{combine_finalizer_exit, Cause, Defect, Exit, FiberId, Halt};
}
