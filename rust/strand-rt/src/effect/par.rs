//! Parallel combinators built on [`Effect::race_fold`] and fork/join.

use super::Effect;
use crate::effect::prim::{Node, Prim};
use crate::effect::Canceler;
use crate::fiber::context::{FiberContext, Resumer};
use crate::fiber::Fiber;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand_core::{Cause, Defect, Exit, Halt};

/// Await `fiber`; if the waiter is interrupted, interrupt the fiber too and
/// wait for it to unwind.
fn await_or_interrupt<R, E2, E, A>(fiber: &Fiber<E, A>) -> Effect<R, E2, Exit<E, A>>
where
    R: Send + Sync + 'static,
    E2: Send + 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    let loser = fiber.clone();
    fiber
        .await_exit::<R, E2>()
        .on_interrupt(Effect::suspend(move || loser.interrupt::<R, E2>().as_unit()))
}

/// Add the sibling's halt to `halt` unless the sibling merely stopped
/// because it was interrupted.
fn keep_sibling<E, A>(halt: Halt<E>, sibling: Exit<E, A>) -> Halt<E> {
    match sibling {
        Exit::Halt(other) if !other.cause.is_interrupted_only() => halt.append(other),
        _ => halt,
    }
}

/// Interrupt every fiber first, then wait for all of them.
fn interrupt_all<R, E2, E, A>(fibers: Vec<Fiber<E, A>>) -> Effect<R, E2, Vec<Exit<E, A>>>
where
    R: Send + Sync + 'static,
    E2: Send + 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    let signal = Effect::collect_all(fibers.iter().map(|f| f.interrupt_fork::<R, E2>()));
    let wait = Effect::collect_all(fibers.iter().map(|f| f.await_exit::<R, E2>()));
    signal.zip_right(wait)
}

impl<R, E, A> Effect<R, E, A>
where
    R: Send + Sync + 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// Run both concurrently and combine their values. The first failure
    /// interrupts the other side; the other side's failure, unless it was
    /// only the interruption, is kept as a remaining cause. When both sides
    /// really failed, `self`'s failure is primary whichever came first.
    pub fn zip_par_with<B, C>(
        self,
        that: Effect<R, E, B>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Effect<R, E, C>
    where
        B: Send + 'static,
        C: Send + 'static,
    {
        let f = Arc::new(f);
        let g = Arc::clone(&f);
        self.race_fold(
            that,
            move |exit: Exit<E, A>, right: Fiber<E, B>| match exit {
                Exit::Done(a) => {
                    let f = Arc::clone(&f);
                    await_or_interrupt(&right).chain_once(move |other| match other {
                        Exit::Done(b) => Effect::now(f(a, b)),
                        Exit::Halt(halt) => Effect::halt_once(halt),
                    })
                }
                Exit::Halt(halt) => right
                    .interrupt()
                    .chain_once(move |other| Effect::halt_once(keep_sibling(halt, other))),
            },
            move |exit: Exit<E, B>, left: Fiber<E, A>| match exit {
                Exit::Done(b) => {
                    let g = Arc::clone(&g);
                    await_or_interrupt(&left).chain_once(move |other| match other {
                        Exit::Done(a) => Effect::now(g(a, b)),
                        Exit::Halt(halt) => Effect::halt_once(halt),
                    })
                }
                Exit::Halt(halt) => left.interrupt().chain_once(move |other| match other {
                    Exit::Halt(first) if !first.cause.is_interrupted_only() => {
                        Effect::halt_once(first.append(halt))
                    }
                    _ => Effect::halt_once(halt),
                }),
            },
        )
    }

    pub fn zip_par<B: Send + 'static>(self, that: Effect<R, E, B>) -> Effect<R, E, (A, B)> {
        self.zip_par_with(that, |a, b| (a, b))
    }

    /// The first success wins and the loser is interrupted. When both fail
    /// the result carries both causes.
    pub fn race(self, that: Effect<R, E, A>) -> Effect<R, E, A> {
        self.race_fold(
            that,
            |exit, right| Self::race_settle(exit, right),
            |exit, left| Self::race_settle(exit, left),
        )
    }

    fn race_settle(exit: Exit<E, A>, loser: Fiber<E, A>) -> Effect<R, E, A> {
        match exit {
            Exit::Done(a) => loser.interrupt::<R, E>().map_once(move |_| a),
            Exit::Halt(first) => await_or_interrupt(&loser).chain_once(move |other| match other {
                Exit::Done(a) => Effect::now(a),
                Exit::Halt(second) => {
                    let mut remaining = first.remaining;
                    remaining.extend(second.remaining);
                    Effect::halt_once(Halt {
                        cause: Cause::both(first.cause, second.cause),
                        remaining,
                    })
                }
            }),
        }
    }

    /// `Some(value)` if `self` settles within `duration`, `None` otherwise,
    /// in which case `self` is interrupted.
    pub fn timeout(self, duration: Duration) -> Effect<R, E, Option<A>> {
        self.race_fold(
            Effect::<R, E, ()>::sleep(duration),
            |exit: Exit<E, A>, timer: Fiber<E, ()>| {
                timer
                    .interrupt::<R, E>()
                    .chain_once(move |_| Effect::done_once(exit.map(Some)))
            },
            |exit: Exit<E, ()>, work: Fiber<E, A>| {
                work.interrupt::<R, E>().chain_once(move |_| match exit {
                    Exit::Done(()) => Effect::now(None),
                    Exit::Halt(halt) => Effect::halt_once(halt),
                })
            },
        )
    }
}

/// Resume with the index of the first child to fail, or `None` once every
/// child has succeeded.
fn first_failure<R, E>(children: Vec<Arc<FiberContext>>) -> Effect<R, E, Option<usize>>
where
    R: Send + Sync + 'static,
    E: Send + 'static,
{
    Effect::from_node(Node::new(Prim::Async(Arc::new(move |resumer: Resumer| {
        let pending = Arc::new(AtomicUsize::new(children.len()));
        let decided = Arc::new(AtomicBool::new(false));
        for (idx, child) in children.iter().enumerate() {
            let watched = Arc::clone(child);
            let pending = Arc::clone(&pending);
            let decided = Arc::clone(&decided);
            let resumer = resumer.clone();
            child.on_done(move || {
                let verdict = if watched.peek_failed() {
                    Some(Some(idx))
                } else if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                    Some(None)
                } else {
                    None
                };
                if let Some(verdict) = verdict {
                    if !decided.swap(true, Ordering::SeqCst) {
                        resumer.resume(Ok(Box::new(verdict)));
                    }
                }
            });
        }
        Box::new(|| {}) as Canceler
    }))))
}

fn nursery<R, E, A>(effects: impl IntoIterator<Item = Effect<R, E, A>>) -> Effect<R, E, Vec<A>>
where
    R: Send + Sync + 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    let effects: Arc<Vec<Effect<R, E, A>>> = Arc::new(effects.into_iter().collect());
    if effects.is_empty() {
        return Effect::suspend(|| Effect::now(Vec::new()));
    }
    Effect::uninterruptible_mask(move |restore| {
        let forks = Effect::collect_all(effects.iter().map(|e| restore.apply(e.clone()).fork::<E>()));
        forks.chain_once(move |fibers: Vec<Fiber<E, A>>| {
            let contexts = fibers.iter().map(|f| Arc::clone(f.context())).collect();
            let fibers = Arc::new(fibers);
            let on_halt = Arc::clone(&fibers);
            restore.apply(first_failure::<R, E>(contexts)).fold_cause_m(
                move |halt: Halt<E>| {
                    tracing::trace!(children = on_halt.len(), "nursery interrupted");
                    interrupt_all::<R, E, E, A>(on_halt.to_vec()).chain_once(move |_| Effect::halt_once(halt))
                },
                move |failed: Option<usize>| match failed {
                    None => Effect::collect_all(fibers.iter().map(|f| f.join())),
                    Some(idx) => {
                        let culprit = fibers[idx].clone();
                        let siblings: Vec<_> = fibers
                            .iter()
                            .enumerate()
                            .filter(|(i, _)| *i != idx)
                            .map(|(_, f)| f.clone())
                            .collect();
                        interrupt_all::<R, E, E, A>(siblings).chain_once(move |exits| {
                            culprit.await_exit::<R, E>().chain_once(move |exit| {
                                let halt = match exit {
                                    Exit::Halt(halt) => halt,
                                    Exit::Done(_) => Halt::new(Cause::die(Defect::runtime(
                                        "failed child reported success",
                                    ))),
                                };
                                Effect::halt_once(exits.into_iter().fold(halt, keep_sibling))
                            })
                        })
                    }
                },
            )
        })
    })
}

impl<R, E, A> Effect<R, E, A>
where
    R: Send + Sync + 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// Run every effect concurrently; collect values in submission order.
    ///
    /// The first child to fail interrupts all its siblings and its halt is
    /// propagated, with sibling failures other than interruption appended as
    /// remaining causes.
    pub fn collect_all_par(effects: impl IntoIterator<Item = Effect<R, E, A>>) -> Effect<R, E, Vec<A>> {
        nursery(effects)
    }

    pub fn for_each_par<T>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Effect<R, E, A>,
    ) -> Effect<R, E, Vec<A>> {
        nursery(items.into_iter().map(f))
    }
}
