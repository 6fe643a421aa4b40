//! Effect descriptions.
//!
//! An [`Effect<R, E, A>`] is an inert, reusable description of a computation
//! that needs an environment `R`, may fail with a typed error `E` and
//! produces an `A`. Nothing happens until a [`Runtime`](crate::Runtime) runs
//! it; running the same description twice runs it twice.
//!
//! ```ignore
//! let program = Effect::<(), String, i32>::succeed(20)
//!     .map(|n| n + 1)
//!     .chain(|n| Effect::sync(move || n * 2));
//! assert_eq!(runtime.run(program, ()), Exit::done(42));
//! ```
//!
//! Constructors that capture a value (`succeed`, `fail`, `done`) clone it on
//! every run, so they require `Clone + Sync`.

pub(crate) mod prim;

mod par;
mod retry;

pub use prim::Canceler;
pub use retry::{BackoffStrategy, RetryPolicy};

use crate::fiber::context::{guard, FiberContext, Resumer};
use crate::fiber::Fiber;
use prim::{downcast, erase_exit, erase_halt, retype_halt, unerase_halt, with_value, Node, Prim, Value};
use std::any::TypeId;
use std::fmt;
use std::marker::PhantomData;
use std::panic::Location;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand_core::{combine_finalizer_exit, Cause, Defect, Exit, FiberId, Halt};

// ---------------------------------------------------------------------------
// Effect
// ---------------------------------------------------------------------------

/// A description of a computation needing `R`, failing with `E`, producing
/// `A`.
pub struct Effect<R, E, A> {
    node: Node,
    _marker: PhantomData<fn(&R) -> Result<A, E>>,
}

impl<R, E, A> Clone for Effect<R, E, A> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _marker: PhantomData,
        }
    }
}

impl<R, E, A> fmt::Debug for Effect<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("env", &std::any::type_name::<R>())
            .field("error", &std::any::type_name::<E>())
            .field("value", &std::any::type_name::<A>())
            .finish()
    }
}

/// Restores the interrupt status captured by
/// [`Effect::uninterruptible_mask`].
#[derive(Debug, Clone, Copy)]
pub struct Restore {
    interruptible: bool,
}

impl Restore {
    /// Run `effect` with the interrupt status that was in force outside the
    /// mask.
    pub fn apply<R, E, A>(&self, effect: Effect<R, E, A>) -> Effect<R, E, A> {
        Effect::from_node(effect.node.set_interruptible(self.interruptible))
    }
}

/// Completion callback handed to [`Effect::async_`] registrations.
///
/// The first completion wins; later ones are ignored and return `false`.
pub struct Resume<E, A> {
    inner: Resumer,
    _marker: PhantomData<fn(Result<A, E>)>,
}

impl<E, A> Clone for Resume<E, A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E: Send + 'static, A: Send + 'static> Resume<E, A> {
    pub fn succeed(&self, value: A) -> bool {
        self.inner.resume(Ok(Box::new(value)))
    }

    pub fn fail(&self, error: E) -> bool {
        self.inner.resume(Err(erase_halt(Halt::new(Cause::Fail(error)))))
    }

    pub fn done(&self, exit: Exit<E, A>) -> bool {
        self.inner.resume(erase_exit(exit))
    }
}

/// Build an effect from user code, turning a panic into a defect.
pub(crate) fn build<R, E, A>(f: impl FnOnce() -> Effect<R, E, A>) -> Effect<R, E, A> {
    match guard(f) {
        Ok(effect) => effect,
        Err(defect) => Effect::from_node(Node::die(defect)),
    }
}

fn same_type<E: 'static, E2: 'static>() -> bool {
    TypeId::of::<E>() == TypeId::of::<E2>()
}

impl<R, E, A> Effect<R, E, A> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    pub(crate) fn node(&self) -> &Node {
        &self.node
    }
}

// -- constructors -----------------------------------------------------------

impl<R, E, A> Effect<R, E, A>
where
    R: Send + Sync + 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// An effect that succeeds with `value`.
    pub fn succeed(value: A) -> Self
    where
        A: Clone + Sync,
    {
        Self::from_node(Node::new(Prim::Succeed(Arc::new(move || {
            Box::new(value.clone()) as Value
        }))))
    }

    /// An effect that fails with `error`. The call site is recorded for
    /// tracing.
    #[track_caller]
    pub fn fail(error: E) -> Self
    where
        E: Clone + Sync,
    {
        Self::halt(Cause::Fail(error))
    }

    /// An effect that halts with `cause`.
    #[track_caller]
    pub fn halt(cause: Cause<E>) -> Self
    where
        E: Clone + Sync,
    {
        let location = Location::caller();
        Self::from_node(Node::new(Prim::Fail(
            Arc::new(move || erase_halt(Halt::new(cause.clone()))),
            location,
        )))
    }

    /// An effect that dies with `defect`.
    #[track_caller]
    pub fn die(defect: impl Into<Defect>) -> Self {
        let defect = defect.into();
        let location = Location::caller();
        Self::from_node(Node::new(Prim::Fail(
            Arc::new(move || Halt::new(Cause::Die(defect.clone()))),
            location,
        )))
    }

    #[track_caller]
    pub fn die_message(message: impl Into<String>) -> Self {
        Self::die(Defect::new(message))
    }

    /// An effect that terminates with `exit`, including its remaining causes.
    pub fn done(exit: Exit<E, A>) -> Self
    where
        E: Clone + Sync,
        A: Clone + Sync,
    {
        Self::from_node(Node::new(Prim::Sync(Arc::new(move || {
            erase_exit(exit.clone())
        }))))
    }

    pub fn from_result(result: Result<A, E>) -> Self
    where
        E: Clone + Sync,
        A: Clone + Sync,
    {
        Self::done(Exit::from(result))
    }

    /// A synchronous side effect. A panic becomes a defect.
    pub fn sync(f: impl Fn() -> A + Send + Sync + 'static) -> Self {
        Self::from_node(Node::new(Prim::Sync(Arc::new(move || {
            Ok(Box::new(f()) as Value)
        }))))
    }

    /// A synchronous side effect that may fail with a typed error.
    pub fn try_sync(f: impl Fn() -> Result<A, E> + Send + Sync + 'static) -> Self {
        Self::from_node(Node::new(Prim::Sync(Arc::new(move || match f() {
            Ok(a) => Ok(Box::new(a) as Value),
            Err(e) => Err(erase_halt(Halt::new(Cause::Fail(e)))),
        }))))
    }

    /// A callback-based effect that cannot be cancelled.
    pub fn async_(register: impl Fn(Resume<E, A>) + Send + Sync + 'static) -> Self {
        Self::async_interrupt(move |resume| {
            register(resume);
            Box::new(|| {}) as Canceler
        })
    }

    /// A callback-based effect. The returned [`Canceler`] runs if the fiber
    /// is interrupted while waiting.
    pub fn async_interrupt(register: impl Fn(Resume<E, A>) -> Canceler + Send + Sync + 'static) -> Self {
        Self::from_node(Node::new(Prim::Async(Arc::new(move |resumer: Resumer| {
            register(Resume {
                inner: resumer,
                _marker: PhantomData,
            })
        }))))
    }

    /// Defer building the effect until it runs. Every self-referential
    /// combinator goes through here so the loop, not the host stack, tracks
    /// depth.
    pub fn suspend(f: impl Fn() -> Effect<R, E, A> + Send + Sync + 'static) -> Self {
        Self::from_node(Node::new(Prim::Suspend(Arc::new(move || f().node))))
    }

    /// Read a value out of the environment.
    pub fn access(f: impl Fn(&R) -> A + Send + Sync + 'static) -> Self {
        Self::access_m(move |r| Effect::now(f(r)))
    }

    pub fn access_m(f: impl Fn(&R) -> Effect<R, E, A> + Send + Sync + 'static) -> Self {
        Self::from_node(Node::new(Prim::Access(Arc::new(move |env| {
            match env.downcast_ref::<R>() {
                Some(r) => f(r).node,
                None => Node::die(prim::mismatch::<R>("environment")),
            }
        }))))
    }

    /// Interrupt the current fiber. The interruption is sticky: recovery
    /// further out cannot turn it back into a success.
    pub fn interrupt() -> Self {
        Self::from_node(Node::descriptor(|fiber| {
            fiber.interrupt_as(fiber.id());
            Node::halt(Halt::new(Cause::Interrupt(fiber.id())))
        }))
    }

    /// An effect that never completes. Only interruption ends it.
    pub fn never() -> Self {
        Self::async_interrupt(|_| Box::new(|| {}))
    }

    // -- one-shot building blocks ------------------------------------------
    //
    // These capture values by move and can be evaluated once. They only
    // appear inside continuations that rebuild them on every run.

    pub(crate) fn now(value: A) -> Self {
        Self::from_node(Node::value(Box::new(value)))
    }

    pub(crate) fn done_once(exit: Exit<E, A>) -> Self {
        Self::from_node(Node::outcome(erase_exit(exit)))
    }

    pub(crate) fn halt_once(halt: Halt<E>) -> Self {
        Self::from_node(Node::halt(erase_halt(halt)))
    }

    pub(crate) fn chain_once<B: Send + 'static>(
        self,
        f: impl FnOnce(A) -> Effect<R, E, B> + Send + 'static,
    ) -> Effect<R, E, B> {
        Effect::from_node(self.node.chain_once(move |v| with_value::<A>(v, |a| f(a).node)))
    }

    pub(crate) fn map_once<B: Send + 'static>(
        self,
        f: impl FnOnce(A) -> B + Send + 'static,
    ) -> Effect<R, E, B> {
        self.chain_once(move |a| Effect::now(f(a)))
    }

    // -- sequencing -------------------------------------------------------

    pub fn map<B: Send + 'static>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Effect<R, E, B> {
        Effect::from_node(
            self.node
                .chain(move |v| with_value::<A>(v, |a| Node::value(Box::new(f(a))))),
        )
    }

    pub fn map_err<E2: Send + 'static>(
        self,
        f: impl Fn(E) -> E2 + Send + Sync + 'static,
    ) -> Effect<R, E2, A> {
        Effect::from_node(Node::new(Prim::MapHalt(
            self.node,
            Arc::new(move |halt| erase_halt(unerase_halt::<E>(halt).map(&f))),
        )))
    }

    pub fn chain<B: Send + 'static>(
        self,
        f: impl Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    ) -> Effect<R, E, B> {
        Effect::from_node(self.node.chain(move |v| with_value::<A>(v, |a| f(a).node)))
    }

    pub fn zip<B: Send + 'static>(self, that: Effect<R, E, B>) -> Effect<R, E, (A, B)> {
        self.zip_with(that, |a, b| (a, b))
    }

    pub fn zip_with<B: Send + 'static, C: Send + 'static>(
        self,
        that: Effect<R, E, B>,
        f: impl Fn(A, B) -> C + Send + Sync + 'static,
    ) -> Effect<R, E, C> {
        let f = Arc::new(f);
        self.chain(move |a| {
            let f = Arc::clone(&f);
            that.clone().map_once(move |b| f(a, b))
        })
    }

    /// Run `self`, then `that`, keeping the result of `that`.
    pub fn zip_right<B: Send + 'static>(self, that: Effect<R, E, B>) -> Effect<R, E, B> {
        self.chain(move |_| that.clone())
    }

    /// Run `self`, then `that`, keeping the result of `self`.
    pub fn zip_left<B: Send + 'static>(self, that: Effect<R, E, B>) -> Effect<R, E, A> {
        self.chain(move |a| that.clone().map_once(move |_| a))
    }

    pub fn as_<B: Clone + Send + Sync + 'static>(self, value: B) -> Effect<R, E, B> {
        self.map(move |_| value.clone())
    }

    pub fn as_unit(self) -> Effect<R, E, ()> {
        self.map(|_| ())
    }

    /// Run an effect on the value, then pass the value through.
    pub fn tap(self, f: impl Fn(&A) -> Effect<R, E, ()> + Send + Sync + 'static) -> Self {
        self.chain(move |a| {
            let effect = f(&a);
            effect.map_once(move |_| a)
        })
    }

    // -- error handling ---------------------------------------------------

    /// Observe the whole halt (cause plus remaining causes) or the value.
    pub fn fold_cause_m<E2: Send + 'static, B: Send + 'static>(
        self,
        on_halt: impl Fn(Halt<E>) -> Effect<R, E2, B> + Send + Sync + 'static,
        on_done: impl Fn(A) -> Effect<R, E2, B> + Send + Sync + 'static,
    ) -> Effect<R, E2, B> {
        Effect::from_node(Node::new(Prim::Fold {
            first: self.node,
            on_halt: Arc::new(move |halt| on_halt(unerase_halt::<E>(halt)).node),
            on_done: Arc::new(move |v| with_value::<A>(v, |a| on_done(a).node)),
            same_error: same_type::<E, E2>(),
        }))
    }

    /// Recover from typed failures. Defects and interruptions pass through.
    pub fn fold_m<E2: Send + 'static, B: Send + 'static>(
        self,
        on_fail: impl Fn(E) -> Effect<R, E2, B> + Send + Sync + 'static,
        on_done: impl Fn(A) -> Effect<R, E2, B> + Send + Sync + 'static,
    ) -> Effect<R, E2, B> {
        let on_halt = Self::recover_with(on_fail);
        Effect::from_node(Node::new(Prim::Fold {
            first: self.node,
            on_halt,
            on_done: Arc::new(move |v| with_value::<A>(v, |a| on_done(a).node)),
            same_error: same_type::<E, E2>(),
        }))
    }

    fn recover_with<E2: Send + 'static, B: Send + 'static>(
        on_fail: impl Fn(E) -> Effect<R, E2, B> + Send + Sync + 'static,
    ) -> prim::HaltCont {
        Arc::new(move |halt| {
            let Halt { cause, remaining } = halt;
            match cause.failure_or_cause() {
                Ok(error) => with_value::<E>(error, |e| on_fail(e).node),
                Err(cause) => Node::halt(retype_halt::<E, E2>(Halt { cause, remaining })),
            }
        })
    }

    pub fn fold<E2: Send + 'static, B: Send + 'static>(
        self,
        on_fail: impl Fn(E) -> B + Send + Sync + 'static,
        on_done: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Effect<R, E2, B> {
        self.fold_m(
            move |e| Effect::now(on_fail(e)),
            move |a| Effect::now(on_done(a)),
        )
    }

    pub fn catch_all<E2: Send + 'static>(
        self,
        f: impl Fn(E) -> Effect<R, E2, A> + Send + Sync + 'static,
    ) -> Effect<R, E2, A> {
        Effect::from_node(Node::new(Prim::Fold {
            first: self.node,
            on_halt: Self::recover_with(f),
            on_done: Arc::new(Node::value),
            same_error: same_type::<E, E2>(),
        }))
    }

    /// Recover from any halt, including defects and interruptions that were
    /// not applied to this fiber.
    pub fn catch_all_cause<E2: Send + 'static>(
        self,
        f: impl Fn(Halt<E>) -> Effect<R, E2, A> + Send + Sync + 'static,
    ) -> Effect<R, E2, A> {
        Effect::from_node(Node::new(Prim::Fold {
            first: self.node,
            on_halt: Arc::new(move |halt| f(unerase_halt::<E>(halt)).node),
            on_done: Arc::new(Node::value),
            same_error: same_type::<E, E2>(),
        }))
    }

    pub fn or_else<E2: Send + 'static>(self, that: Effect<R, E2, A>) -> Effect<R, E2, A> {
        self.catch_all(move |_| that.clone())
    }

    pub fn either<E2: Send + 'static>(self) -> Effect<R, E2, Result<A, E>> {
        self.fold(Err, Ok)
    }

    /// Surface the exit as a value. Never fails.
    pub fn result<E2: Send + 'static>(self) -> Effect<R, E2, Exit<E, A>> {
        Effect::from_node(Node::new(Prim::Fold {
            first: self.node,
            on_halt: Arc::new(|halt| {
                Node::value(Box::new(Exit::<E, A>::Halt(unerase_halt(halt))))
            }),
            on_done: Arc::new(|v| {
                Node::outcome(
                    downcast::<A>(v).map(|a| Box::new(Exit::<E, A>::Done(a)) as Value),
                )
            }),
            same_error: same_type::<E, E2>(),
        }))
    }

    /// Turn typed failures into defects.
    pub fn or_die<E2: Send + 'static>(self) -> Effect<R, E2, A>
    where
        E: fmt::Debug,
    {
        self.catch_all(|e| Effect::die(Defect::new(format!("{e:?}"))))
    }

    // -- finalization -----------------------------------------------------

    /// Acquire, use and release. Acquisition and release are
    /// uninterruptible; release runs exactly once after `use_` settles and
    /// sees its exit. Release failures merge per
    /// [`combine_finalizer_exit`].
    pub fn bracket_exit<B: Send + 'static>(
        acquire: Effect<R, E, A>,
        use_: impl Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
        release: impl Fn(A, &Exit<E, B>) -> Effect<R, E, ()> + Send + Sync + 'static,
    ) -> Effect<R, E, B>
    where
        A: Clone,
    {
        let use_ = Arc::new(use_);
        let release = Arc::new(release);
        Effect::uninterruptible_mask(move |restore| {
            let use_ = Arc::clone(&use_);
            let release = Arc::clone(&release);
            acquire.clone().chain(move |a| {
                let release = Arc::clone(&release);
                let held = a.clone();
                let used = build(|| use_(a));
                restore
                    .apply(used)
                    .result::<E>()
                    .chain_once(move |exit: Exit<E, B>| {
                        build(|| release(held, &exit))
                            .result::<E>()
                            .chain_once(move |released| {
                                Effect::done_once(combine_finalizer_exit(exit, released))
                            })
                    })
            })
        })
    }

    pub fn bracket<B: Send + 'static>(
        acquire: Effect<R, E, A>,
        use_: impl Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
        release: impl Fn(A) -> Effect<R, E, ()> + Send + Sync + 'static,
    ) -> Effect<R, E, B>
    where
        A: Clone,
    {
        Self::bracket_exit(acquire, use_, move |a, _| release(a))
    }

    /// Run `cleanup` with the exit of `self`, whatever it is.
    pub fn on_exit(self, cleanup: impl Fn(&Exit<E, A>) -> Effect<R, E, ()> + Send + Sync + 'static) -> Self {
        Effect::<R, E, ()>::bracket_exit(Effect::unit(), move |_| self.clone(), move |_, exit| {
            cleanup(exit)
        })
    }

    /// Run `finalizer` after `self`, however it ends.
    pub fn ensuring(self, finalizer: Effect<R, E, ()>) -> Self {
        self.on_exit(move |_| finalizer.clone())
    }

    /// Run `cleanup` only when `self` ends by interruption.
    pub fn on_interrupt(self, cleanup: Effect<R, E, ()>) -> Self {
        self.on_exit(move |exit| {
            if exit.is_interrupted() {
                cleanup.clone()
            } else {
                Effect::unit()
            }
        })
    }

    // -- environment ------------------------------------------------------

    /// Supply the environment, eliminating the requirement.
    pub fn provide<R0: Send + Sync + 'static>(self, env: R) -> Effect<R0, E, A> {
        Effect::from_node(Node::new(Prim::Provide(Arc::new(env), self.node)))
    }

    /// Build this effect's environment from an outer one.
    pub fn provide_some<R0: Send + Sync + 'static>(
        self,
        f: impl Fn(&R0) -> R + Send + Sync + 'static,
    ) -> Effect<R0, E, A> {
        let node = self.node;
        Effect::from_node(Node::new(Prim::Access(Arc::new(move |env| {
            match env.downcast_ref::<R0>() {
                Some(outer) => Node::new(Prim::Provide(Arc::new(f(outer)), node.clone())),
                None => Node::die(prim::mismatch::<R0>("environment")),
            }
        }))))
    }

    // -- interruptibility -------------------------------------------------

    pub fn uninterruptible(self) -> Self {
        Self::from_node(self.node.set_interruptible(false))
    }

    pub fn interruptible(self) -> Self {
        Self::from_node(self.node.set_interruptible(true))
    }

    /// Run `f` uninterruptibly, handing it a [`Restore`] that re-enables the
    /// outer interrupt status for the parts that should stay cancellable.
    pub fn uninterruptible_mask(f: impl Fn(Restore) -> Effect<R, E, A> + Send + Sync + 'static) -> Self {
        Self::from_node(Node::new(Prim::InterruptStatus(Arc::new(move |status| {
            f(Restore {
                interruptible: status,
            })
            .node
            .set_interruptible(false)
        }))))
    }

    // -- concurrency ------------------------------------------------------

    /// Start `self` on a child fiber attached to the current one. The child
    /// inherits the environment and interrupt status and is interrupted when
    /// the parent completes.
    pub fn fork<E2: Send + 'static>(self) -> Effect<R, E2, Fiber<E, A>> {
        self.fork_with(false)
    }

    /// Like [`Effect::fork`], but the child outlives its parent.
    pub fn fork_daemon<E2: Send + 'static>(self) -> Effect<R, E2, Fiber<E, A>> {
        self.fork_with(true)
    }

    fn fork_with<E2: Send + 'static>(self, daemon: bool) -> Effect<R, E2, Fiber<E, A>> {
        let fork = Node::new(Prim::Fork {
            child: self.node,
            daemon,
        });
        Effect::from_node(fork.chain(|v| {
            with_value::<Arc<FiberContext>>(v, |ctx| {
                Node::value(Box::new(Fiber::<E, A>::from_context(ctx)))
            })
        }))
    }

    /// Wait `duration`, then run `self`.
    pub fn delay(self, duration: Duration) -> Self {
        Effect::<R, E, ()>::sleep(duration).zip_right(self)
    }

    /// Repeat `self` until it fails.
    pub fn forever<B: Send + 'static>(self) -> Effect<R, E, B> {
        let again = self.clone();
        self.zip_right(Effect::suspend(move || again.clone().forever()))
    }

    /// Run `self` once, then `n` more times, keeping the last value.
    pub fn repeat_n(self, n: usize) -> Self {
        if n == 0 {
            return self;
        }
        let again = self.clone();
        self.zip_right(Effect::suspend(move || again.clone().repeat_n(n - 1)))
    }

    // -- collections ------------------------------------------------------

    /// Run every effect in order, collecting the values.
    pub fn collect_all(effects: impl IntoIterator<Item = Effect<R, E, A>>) -> Effect<R, E, Vec<A>> {
        let effects: Arc<Vec<Effect<R, E, A>>> = Arc::new(effects.into_iter().collect());
        Effect::suspend(move || {
            let acc = Vec::with_capacity(effects.len());
            collect_from(Arc::clone(&effects), 0, acc)
        })
    }

    pub fn for_each<T>(
        items: impl IntoIterator<Item = T>,
        f: impl Fn(T) -> Effect<R, E, A>,
    ) -> Effect<R, E, Vec<A>> {
        Self::collect_all(items.into_iter().map(f))
    }
}

fn collect_from<R, E, A>(
    effects: Arc<Vec<Effect<R, E, A>>>,
    idx: usize,
    mut acc: Vec<A>,
) -> Effect<R, E, Vec<A>>
where
    R: Send + Sync + 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    match effects.get(idx) {
        None => Effect::now(acc),
        Some(effect) => effect.clone().chain_once(move |a| {
            acc.push(a);
            collect_from(effects, idx + 1, acc)
        }),
    }
}

impl<R, E, A> Effect<R, E, Effect<R, E, A>>
where
    R: Send + Sync + 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    pub fn flatten(self) -> Effect<R, E, A> {
        self.chain(|inner| inner)
    }
}

impl<R, E> Effect<R, E, ()>
where
    R: Send + Sync + 'static,
    E: Send + 'static,
{
    pub fn unit() -> Self {
        Self::from_node(Node::unit())
    }

    /// Give up the worker; the fiber is re-queued behind other work.
    pub fn yield_now() -> Self {
        Self::from_node(Node::new(Prim::Yield))
    }

    /// Suspend the fiber for `duration`. Interrupting it cancels the timer.
    pub fn sleep(duration: Duration) -> Self {
        Self::from_node(Node::new(Prim::Async(Arc::new(move |resumer: Resumer| {
            let platform = Arc::clone(resumer.fiber().platform());
            let deadline = Instant::now() + duration;
            let wake = resumer.clone();
            let key = platform.timer.schedule(deadline, move || {
                wake.resume(Ok(Box::new(())));
            });
            Box::new(move || {
                platform.timer.cancel(key);
            }) as Canceler
        }))))
    }
}

impl<R, E> Effect<R, E, R>
where
    R: Clone + Send + Sync + 'static,
    E: Send + 'static,
{
    /// The whole environment.
    pub fn environment() -> Self {
        Self::access(R::clone)
    }
}

impl<R, E> Effect<R, E, FiberId>
where
    R: Send + Sync + 'static,
    E: Send + 'static,
{
    /// The id of the fiber running this effect.
    pub fn fiber_id() -> Self {
        Self::from_node(Node::descriptor(|fiber| Node::value(Box::new(fiber.id()))))
    }
}
