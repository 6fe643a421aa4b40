//! The race primitive every parallel combinator is built from.

use super::context::{FiberContext, Resumer};
use super::Fiber;
use crate::effect::prim::{Node, Prim};
use crate::effect::{Canceler, Effect};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strand_core::{Exit, Halt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

/// Suspend until either fiber finishes; report which one did first.
fn first_done<R, E>(left: Arc<FiberContext>, right: Arc<FiberContext>) -> Effect<R, E, Side>
where
    R: Send + Sync + 'static,
    E: Send + 'static,
{
    Effect::from_node(Node::new(Prim::Async(Arc::new(move |resumer: Resumer| {
        let decided = Arc::new(AtomicBool::new(false));
        for (ctx, side) in [(&left, Side::Left), (&right, Side::Right)] {
            let decided = Arc::clone(&decided);
            let resumer = resumer.clone();
            ctx.on_done(move || {
                if !decided.swap(true, Ordering::SeqCst) {
                    resumer.resume(Ok(Box::new(side)));
                }
            });
        }
        Box::new(|| {}) as Canceler
    }))))
}

impl<R, E, A> Effect<R, E, A>
where
    R: Send + Sync + 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// Run `self` and `that` on two child fibers. When the first one
    /// finishes, its handler receives its exit together with the other
    /// fiber, which is still running (or finished but not yet observed).
    ///
    /// If the racing fiber is interrupted while waiting, both children are
    /// interrupted and awaited before the interruption propagates.
    pub fn race_fold<E1, B, E2, C>(
        self,
        that: Effect<R, E1, B>,
        on_left: impl Fn(Exit<E, A>, Fiber<E1, B>) -> Effect<R, E2, C> + Send + Sync + 'static,
        on_right: impl Fn(Exit<E1, B>, Fiber<E, A>) -> Effect<R, E2, C> + Send + Sync + 'static,
    ) -> Effect<R, E2, C>
    where
        E1: Send + 'static,
        B: Send + 'static,
        E2: Send + 'static,
        C: Send + 'static,
    {
        let on_left = Arc::new(on_left);
        let on_right = Arc::new(on_right);
        Effect::uninterruptible_mask(move |restore| {
            let left = restore.apply(self.clone()).fork::<E2>();
            let right = restore.apply(that.clone()).fork::<E2>();
            let on_left = Arc::clone(&on_left);
            let on_right = Arc::clone(&on_right);
            left.chain_once(move |lf: Fiber<E, A>| {
                right.chain_once(move |rf: Fiber<E1, B>| {
                    let waited = restore.apply(first_done::<R, E2>(
                        Arc::clone(lf.context()),
                        Arc::clone(rf.context()),
                    ));
                    let (lh, rh) = (lf.clone(), rf.clone());
                    waited.fold_cause_m(
                        move |halt: Halt<E2>| {
                            tracing::trace!(left = %lh.id(), right = %rh.id(), "race interrupted");
                            lh.interrupt_fork::<R, E2>()
                                .zip_right(rh.interrupt_fork())
                                .zip_right(lh.await_exit::<R, E2>())
                                .zip_right(rh.await_exit::<R, E2>())
                                .chain_once(move |_| Effect::halt_once(halt))
                        },
                        move |side| match side {
                            Side::Left => {
                                let on_left = Arc::clone(&on_left);
                                let loser = rf.clone();
                                lf.await_exit::<R, E2>().chain_once(move |exit| {
                                    restore.apply(on_left(exit, loser))
                                })
                            }
                            Side::Right => {
                                let on_right = Arc::clone(&on_right);
                                let loser = lf.clone();
                                rf.await_exit::<R, E2>().chain_once(move |exit| {
                                    restore.apply(on_right(exit, loser))
                                })
                            }
                        },
                    )
                })
            })
        })
    }
}
