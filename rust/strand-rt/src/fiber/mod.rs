//! Fibers: lightweight threads of execution driven by the interpreter.
//!
//! A [`Fiber`] is the handle returned by [`Effect::fork`]. It can be joined,
//! awaited or interrupted from any other fiber.

pub(crate) mod context;
mod race;

use crate::effect::prim::{erase_exit, unerase_outcome, Node, Prim};
use crate::effect::{Canceler, Effect};
use context::{FiberContext, Resumer};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use strand_core::{Exit, FiberId};

/// Handle to a running (or finished) fiber producing `Exit<E, A>`.
///
/// The exit is delivered to the first `join`/`await_exit`/`interrupt` that
/// observes it. Later observers receive a defect saying so.
pub struct Fiber<E, A> {
    ctx: Arc<FiberContext>,
    _marker: PhantomData<fn() -> (E, A)>,
}

impl<E, A> Clone for Fiber<E, A> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            _marker: PhantomData,
        }
    }
}

impl<E, A> fmt::Debug for Fiber<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.ctx.id())
            .field("finished", &self.ctx.is_finished())
            .finish()
    }
}

impl<E, A> Fiber<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    pub(crate) fn from_context(ctx: Arc<FiberContext>) -> Self {
        Self {
            ctx,
            _marker: PhantomData,
        }
    }

    pub(crate) fn context(&self) -> &Arc<FiberContext> {
        &self.ctx
    }

    pub fn id(&self) -> FiberId {
        self.ctx.id()
    }

    pub fn is_finished(&self) -> bool {
        self.ctx.is_finished()
    }

    /// Wait for the fiber to finish and surface its exit as a value.
    pub fn await_exit<R, E2>(&self) -> Effect<R, E2, Exit<E, A>>
    where
        R: Send + Sync + 'static,
        E2: Send + 'static,
    {
        let ctx = Arc::clone(&self.ctx);
        Effect::from_node(Node::new(Prim::Async(Arc::new(move |resumer: Resumer| {
            let done = Arc::clone(&ctx);
            ctx.on_done(move || {
                let exit: Exit<E, A> = unerase_outcome(done.take_exit());
                if let Err(Ok(v)) = resumer.try_resume(Ok(Box::new(exit))) {
                    // The waiter was interrupted before the exit arrived;
                    // put it back for the next observer.
                    if let Ok(exit) = v.downcast::<Exit<E, A>>() {
                        done.restore_exit(erase_exit(*exit));
                    }
                }
            });
            Box::new(|| {}) as Canceler
        }))))
    }

    /// Wait for the fiber and adopt its exit: its value on success, its halt
    /// (including remaining causes) otherwise.
    pub fn join<R>(&self) -> Effect<R, E, A>
    where
        R: Send + Sync + 'static,
    {
        self.await_exit::<R, E>().chain_once(Effect::done_once)
    }

    /// Interrupt the fiber on behalf of the caller and wait until it has
    /// finished, finalizers included.
    pub fn interrupt<R, E2>(&self) -> Effect<R, E2, Exit<E, A>>
    where
        R: Send + Sync + 'static,
        E2: Send + 'static,
    {
        let target = Arc::clone(&self.ctx);
        let waiting = self.clone();
        let send = Effect::<R, E2, ()>::from_node(Node::descriptor(move |caller| {
            target.interrupt_as(caller.id());
            Node::unit()
        }));
        send.zip_right(Effect::suspend(move || waiting.await_exit()))
    }

    /// Request interruption without waiting for the fiber to finish.
    pub fn interrupt_fork<R, E2>(&self) -> Effect<R, E2, ()>
    where
        R: Send + Sync + 'static,
        E2: Send + 'static,
    {
        let target = Arc::clone(&self.ctx);
        Effect::from_node(Node::descriptor(move |caller| {
            target.interrupt_as(caller.id());
            Node::unit()
        }))
    }
}
