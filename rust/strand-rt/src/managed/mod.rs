//! Managed resources: acquisition paired with guaranteed release.
//!
//! A [`Managed<R, E, A>`] wraps an effect that acquires an `A` and returns it
//! together with its finalizer (a [`Reservation`]). [`Managed::use_`] is the
//! safe consumer: acquisition runs uninterruptibly, the consumer runs with
//! the caller's interrupt status, and the finalizer runs uninterruptibly
//! exactly once with the consumer's exit, however it settled. Failures of
//! the finalizer are merged with [`combine_finalizer_exit`].
//!
//! Composed scopes release in reverse acquisition order.

mod par;

use crate::effect::{build, Effect};
use crate::fiber::Fiber;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strand_core::{combine_finalizer_exit, Exit, Halt};

/// Release action of a reservation. Receives the exit of the scope that used
/// the resource.
pub type Finalizer<R, E> = Arc<dyn Fn(&Exit<E, ()>) -> Effect<R, E, ()> + Send + Sync>;

/// An acquired value and the action that releases it.
pub struct Reservation<R, E, A> {
    pub value: A,
    pub release: Finalizer<R, E>,
}

impl<R, E, A: Clone> Clone for Reservation<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            release: Arc::clone(&self.release),
        }
    }
}

impl<R, E, A: fmt::Debug> fmt::Debug for Reservation<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation").field("value", &self.value).finish_non_exhaustive()
    }
}

fn no_release<R, E>() -> Finalizer<R, E>
where
    R: Send + Sync + 'static,
    E: Send + 'static,
{
    Arc::new(|_| Effect::unit())
}

/// Run `release` with `exit` and merge its outcome into `exit`.
pub(crate) fn release_into<R, E, A>(
    release: &Finalizer<R, E>,
    exit: Exit<E, A>,
) -> Effect<R, E, A>
where
    R: Send + Sync + 'static,
    E: Clone + Send + 'static,
    A: Send + 'static,
{
    let seen = exit.as_unit();
    build(|| release(&seen))
        .result::<E>()
        .chain_once(move |released| Effect::done_once(combine_finalizer_exit(exit, released)))
}

/// A resource acquired with [`Managed::allocate`] whose release is the
/// caller's responsibility. Releasing more than once is a no-op.
pub struct Leak<R, E, A> {
    pub value: A,
    release: Finalizer<R, E>,
    released: Arc<AtomicBool>,
}

impl<R, E, A: fmt::Debug> fmt::Debug for Leak<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leak")
            .field("value", &self.value)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

impl<R, E, A> Leak<R, E, A>
where
    R: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Release as if the scope had succeeded.
    pub fn release(&self) -> Effect<R, E, ()> {
        self.release_exit(&Exit::done(()))
    }

    /// Release with the given scope exit.
    pub fn release_exit(&self, exit: &Exit<E, ()>) -> Effect<R, E, ()> {
        let release = Arc::clone(&self.release);
        let released = Arc::clone(&self.released);
        let exit = exit.clone();
        Effect::suspend(move || {
            if released.swap(true, Ordering::SeqCst) {
                return Effect::unit();
            }
            build(|| release(&exit))
        })
        .uninterruptible()
    }
}

/// A resource with scoped, guaranteed release.
pub struct Managed<R, E, A> {
    reserve: Effect<R, E, Reservation<R, E, A>>,
}

impl<R, E, A> Clone for Managed<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            reserve: self.reserve.clone(),
        }
    }
}

impl<R, E, A> fmt::Debug for Managed<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Managed")
            .field("value", &std::any::type_name::<A>())
            .finish_non_exhaustive()
    }
}

impl<R, E, A> Managed<R, E, A>
where
    R: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    /// Build from an effect producing a reservation.
    pub fn from_reservation(reserve: Effect<R, E, Reservation<R, E, A>>) -> Self {
        Self { reserve }
    }

    pub fn succeed(value: A) -> Self {
        Self::from_effect(Effect::succeed(value))
    }

    /// A resource with nothing to release.
    pub fn from_effect(acquire: Effect<R, E, A>) -> Self {
        Self {
            reserve: acquire.map(|value| Reservation {
                value,
                release: no_release(),
            }),
        }
    }

    #[track_caller]
    pub fn fail(error: E) -> Self {
        Self {
            reserve: Effect::fail(error),
        }
    }

    /// Acquire with `acquire`; release with `release`, which sees the scope's
    /// exit.
    pub fn bracket_exit(
        acquire: Effect<R, E, A>,
        release: impl Fn(A, &Exit<E, ()>) -> Effect<R, E, ()> + Send + Sync + 'static,
    ) -> Self {
        let release = Arc::new(release);
        Self {
            reserve: acquire.map(move |value| {
                let release = Arc::clone(&release);
                let held = value.clone();
                Reservation {
                    value,
                    release: Arc::new(move |exit| release(held.clone(), exit)),
                }
            }),
        }
    }

    pub fn bracket(
        acquire: Effect<R, E, A>,
        release: impl Fn(A) -> Effect<R, E, ()> + Send + Sync + 'static,
    ) -> Self {
        Self::bracket_exit(acquire, move |a, _| release(a))
    }

    /// Defer building the resource description until it is acquired.
    pub fn suspend(f: impl Fn() -> Managed<R, E, A> + Send + Sync + 'static) -> Self {
        Self {
            reserve: Effect::suspend(move || f().reserve),
        }
    }

    /// Acquire, hand the value to `f`, and release exactly once after `f`'s
    /// effect settles.
    pub fn use_<B: Send + 'static>(
        self,
        f: impl Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Effect<R, E, B> {
        Effect::bracket_exit(
            self.reserve,
            move |reservation| f(reservation.value),
            |reservation, exit| {
                let seen = exit.as_unit();
                (reservation.release)(&seen)
            },
        )
    }

    /// Acquire now; the caller releases through the returned [`Leak`].
    ///
    /// An interruption that arrives while the resource is being acquired
    /// releases it with the interrupted exit instead of handing it over.
    pub fn allocate(self) -> Effect<R, E, Leak<R, E, A>> {
        let reserve = self.reserve;
        Effect::uninterruptible_mask(move |restore| {
            reserve.clone().chain(move |reservation: Reservation<R, E, A>| {
                let leak = Leak {
                    value: reservation.value,
                    release: reservation.release,
                    released: Arc::new(AtomicBool::new(false)),
                };
                restore
                    .apply(Effect::<R, E, ()>::unit())
                    .result::<E>()
                    .chain_once(move |checked| match checked {
                        Exit::Done(()) => Effect::now(leak),
                        Exit::Halt(halt) => {
                            leak.released.store(true, Ordering::SeqCst);
                            release_into(&leak.release, Exit::Halt(halt))
                        }
                    })
            })
        })
    }

    /// Acquire `self`, then the resource `f` builds from its value. The
    /// inner resource is released first. If the inner acquisition fails the
    /// outer resource is released before the failure surfaces.
    pub fn chain<B: Clone + Send + Sync + 'static>(
        self,
        f: impl Fn(A) -> Managed<R, E, B> + Send + Sync + 'static,
    ) -> Managed<R, E, B> {
        let f = Arc::new(f);
        Managed {
            reserve: self.reserve.chain(move |outer: Reservation<R, E, A>| {
                let f = Arc::clone(&f);
                let value = outer.value.clone();
                build(move || f(value).reserve)
                    .result::<E>()
                    .chain_once(move |acquired| match acquired {
                        Exit::Done(inner) => Effect::now(Reservation {
                            value: inner.value,
                            release: nested(inner.release, outer.release),
                        }),
                        Exit::Halt(halt) => release_into(&outer.release, Exit::Halt(halt)),
                    })
            }),
        }
    }

    pub fn map<B: Clone + Send + Sync + 'static>(
        self,
        f: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Managed<R, E, B> {
        Managed {
            reserve: self.reserve.map(move |r| Reservation {
                value: f(r.value),
                release: r.release,
            }),
        }
    }

    pub fn zip_with<B, C>(
        self,
        that: Managed<R, E, B>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Managed<R, E, C>
    where
        B: Clone + Send + Sync + 'static,
        C: Clone + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.chain(move |a| {
            let f = Arc::clone(&f);
            that.clone().map(move |b| f(a.clone(), b))
        })
    }

    pub fn zip<B: Clone + Send + Sync + 'static>(self, that: Managed<R, E, B>) -> Managed<R, E, (A, B)> {
        self.zip_with(that, |a, b| (a, b))
    }

    pub fn as_<B: Clone + Send + Sync + 'static>(self, value: B) -> Managed<R, E, B> {
        self.map(move |_| value.clone())
    }

    /// Acquire the resource built by `f` inside this scope, keeping this
    /// scope's value.
    pub fn chain_tap<B: Clone + Send + Sync + 'static>(
        self,
        f: impl Fn(A) -> Managed<R, E, B> + Send + Sync + 'static,
    ) -> Self {
        self.chain(move |a| f(a.clone()).as_(a))
    }

    /// Build this resource's environment from an outer one. The finalizer
    /// runs with the same environment.
    pub fn provide_some<R0: Send + Sync + 'static>(
        self,
        f: impl Fn(&R0) -> R + Send + Sync + 'static,
    ) -> Managed<R0, E, A> {
        let f = Arc::new(f);
        let outer = Arc::clone(&f);
        Managed {
            reserve: self
                .reserve
                .provide_some(move |r0: &R0| outer(r0))
                .map(move |r| {
                    let f = Arc::clone(&f);
                    let release = r.release;
                    Reservation {
                        value: r.value,
                        release: Arc::new(move |exit| {
                            let f = Arc::clone(&f);
                            release(exit).provide_some(move |r0: &R0| f(r0))
                        }),
                    }
                }),
        }
    }
}

impl<R, E, A> Managed<R, E, Fiber<E, A>>
where
    R: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    A: Send + 'static,
{
    /// Run `effect` on a fiber for the lifetime of the scope; leaving the
    /// scope interrupts it.
    ///
    /// Acquisition is uninterruptible, so the child is forked with
    /// interruption re-enabled or the release could never stop it.
    pub fn fiber(effect: Effect<R, E, A>) -> Self {
        Managed::bracket(effect.interruptible().fork(), |fiber: Fiber<E, A>| {
            fiber.interrupt::<R, E>().as_unit()
        })
    }
}

/// Release `inner`, then `outer`, whatever `inner` did.
fn nested<R, E>(inner: Finalizer<R, E>, outer: Finalizer<R, E>) -> Finalizer<R, E>
where
    R: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    Arc::new(move |exit: &Exit<E, ()>| {
        let outer = Arc::clone(&outer);
        let seen = exit.clone();
        build(|| inner(exit)).result::<E>().chain_once(move |first| {
            build(|| outer(&seen))
                .result::<E>()
                .chain_once(move |second| Effect::done_once(combine_finalizer_exit(first, second)))
        })
    })
}

/// Keep `other` as a remaining cause of `primary` unless it is only the
/// interruption.
pub(crate) fn with_sibling<E>(primary: Halt<E>, other: Halt<E>) -> Halt<E> {
    if other.cause.is_interrupted_only() {
        primary
    } else {
        primary.append(other)
    }
}
