//! The runtime: a worker pool plus a timer that fibers run on.

use crate::config::{ConfigError, RuntimeConfig};
use crate::effect::prim::unerase_outcome;
use crate::effect::Effect;
use crate::fiber::context::FiberContext;
use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use crate::timer::Timer;
use std::fmt;
use std::sync::Arc;
use strand_core::{Defect, Exit, FiberId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to start runtime threads: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Services shared by every fiber of a runtime.
pub(crate) struct Platform {
    pub(crate) scheduler: Scheduler,
    pub(crate) timer: Timer,
    pub(crate) config: RuntimeConfig,
}

/// Runs effects to completion.
///
/// Dropping the runtime stops its worker and timer threads. Fibers that are
/// still suspended at that point never resume.
pub struct Runtime {
    platform: Arc<Platform>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.platform.scheduler.worker_count())
            .field("yield_op_count", &self.platform.config.yield_op_count)
            .finish()
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let scheduler = Scheduler::new(config.resolved_worker_threads(), &config.thread_name_prefix)?;
        let timer = Timer::new(&format!("{}-timer", config.thread_name_prefix))?;
        tracing::debug!(
            workers = scheduler.worker_count(),
            yield_op_count = config.yield_op_count,
            "runtime started"
        );
        Ok(Self {
            platform: Arc::new(Platform {
                scheduler,
                timer,
                config,
            }),
        })
    }

    /// A runtime configured from `strand.toml` (or defaults).
    pub fn load() -> Result<Self, RuntimeError> {
        Self::new(RuntimeConfig::load()?)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.platform.config
    }

    /// Run `effect` with `env` and block the calling thread until it
    /// finishes.
    ///
    /// Must not be called from inside a fiber: the calling worker would be
    /// blocked for the whole run.
    pub fn run<R, E, A>(&self, effect: Effect<R, E, A>, env: R) -> Exit<E, A>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
        A: Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.run_async(effect, env, move |exit| {
            let _ = tx.send(exit);
        });
        rx.recv()
            .unwrap_or_else(|_| Exit::die(Defect::runtime("runtime shut down before the effect finished")))
    }

    /// Start `effect` on a root fiber and call `callback` with its exit.
    pub fn run_async<R, E, A>(
        &self,
        effect: Effect<R, E, A>,
        env: R,
        callback: impl FnOnce(Exit<E, A>) + Send + 'static,
    ) -> FiberId
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
        A: Send + 'static,
    {
        let fiber = FiberContext::new(Arc::clone(&self.platform));
        let done = Arc::clone(&fiber);
        fiber.on_done(move || callback(unerase_outcome(done.take_exit())));
        fiber.start(effect.node().clone(), Arc::new(env), true);
        fiber.id()
    }

    /// Start `effect` on a detached root fiber and return its handle.
    pub fn fork<R, E, A>(&self, effect: Effect<R, E, A>, env: R) -> Fiber<E, A>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
        A: Send + 'static,
    {
        let fiber = FiberContext::new(Arc::clone(&self.platform));
        fiber.start(effect.node().clone(), Arc::new(env), true);
        Fiber::from_context(fiber)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // Queued tasks own their fibers, which own the platform; dropping
        // them here breaks that cycle.
        self.platform.scheduler.shutdown();
        let dropped = self.platform.scheduler.drain();
        self.platform.timer.shutdown();
        tracing::debug!(dropped, "runtime stopped");
    }
}
