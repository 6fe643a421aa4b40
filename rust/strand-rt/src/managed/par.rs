//! Parallel acquisition and release.

use super::{release_into, with_sibling, Finalizer, Managed, Reservation};
use crate::effect::{build, Effect};
use crate::fiber::Fiber;
use std::sync::Arc;
use strand_core::{combine_finalizer_exit, Exit};

type Reserved<R, E, A> = Exit<E, Reservation<R, E, A>>;

/// Release both sides concurrently. When both fail, `left`'s failure is
/// primary.
fn release_both<R, E>(left: Finalizer<R, E>, right: Finalizer<R, E>) -> Finalizer<R, E>
where
    R: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    Arc::new(move |exit: &Exit<E, ()>| {
        let l = build(|| left(exit)).result::<E>();
        let r = build(|| right(exit)).result::<E>();
        l.zip_par(r)
            .chain_once(|(first, second)| Effect::done_once(combine_finalizer_exit(first, second)))
    })
}

/// Both acquisitions have settled; keep both, or release whatever was
/// acquired and fail.
fn settle<R, E, A, B, C>(
    left: Reserved<R, E, A>,
    right: Reserved<R, E, B>,
    f: Arc<dyn Fn(A, B) -> C + Send + Sync>,
) -> Effect<R, E, Reservation<R, E, C>>
where
    R: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
{
    match (left, right) {
        (Exit::Done(a), Exit::Done(b)) => Effect::now(Reservation {
            value: f(a.value, b.value),
            release: release_both(a.release, b.release),
        }),
        (Exit::Done(a), Exit::Halt(failed)) => release_into(&a.release, Exit::Halt(failed)),
        (Exit::Halt(failed), Exit::Done(b)) => release_into(&b.release, Exit::Halt(failed)),
        (Exit::Halt(first), Exit::Halt(second)) => {
            Effect::halt_once(with_sibling::<E>(first, second))
        }
    }
}

impl<R, E, A> Managed<R, E, A>
where
    R: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    /// Acquire both resources concurrently and release both concurrently.
    ///
    /// If one acquisition succeeds and the other fails, the acquired side is
    /// released before the failure surfaces. If both fail, `self`'s failure
    /// is primary and `that`'s is kept as a remaining cause.
    pub fn par_zip_with<B, C>(
        self,
        that: Managed<R, E, B>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Managed<R, E, C>
    where
        B: Clone + Send + Sync + 'static,
        C: Clone + Send + Sync + 'static,
    {
        let f: Arc<dyn Fn(A, B) -> C + Send + Sync> = Arc::new(f);
        let g = Arc::clone(&f);
        let reserve = self.reserve.race_fold(
            that.reserve,
            move |left: Reserved<R, E, A>, other: Fiber<E, Reservation<R, E, B>>| {
                let f = Arc::clone(&f);
                other
                    .await_exit::<R, E>()
                    .chain_once(move |right| settle(left, right, f))
            },
            move |right: Reserved<R, E, B>, other: Fiber<E, Reservation<R, E, A>>| {
                let g = Arc::clone(&g);
                other
                    .await_exit::<R, E>()
                    .chain_once(move |left| settle(left, right, g))
            },
        );
        Managed {
            reserve: reserve.uninterruptible(),
        }
    }

    pub fn par_zip<B: Clone + Send + Sync + 'static>(self, that: Managed<R, E, B>) -> Managed<R, E, (A, B)> {
        self.par_zip_with(that, |a, b| (a, b))
    }
}
