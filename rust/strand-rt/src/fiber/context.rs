//! Fiber state and the interpreter loop.
//!
//! A fiber is driven by [`FiberContext::run`], a loop over an explicit
//! continuation stack. Each iteration handles one [`Step`]:
//!
//! - `Eval(node)` dispatches on the node's [`Prim`], pushing frames for
//!   `Chain`, `Fold`, `Provide` and friends instead of recursing.
//! - `Value(v)` pops the next frame and feeds it `v`.
//! - `Halt(h)` unwinds frames until a `Fold` recovers it.
//!
//! Host stack use is therefore constant for any chain length. Every call into
//! user code is wrapped in `catch_unwind`; a panic becomes `Cause::Die`.
//!
//! # Suspension
//!
//! `Async` registers a [`Resumer`] and, unless the callback fired during
//! registration, parks the run state inside a [`Suspension`] and returns the
//! worker to the scheduler. Exactly one of "resume" and "interrupt" wins the
//! suspension; the winner reschedules the parked run state.
//!
//! Lock order: suspension, then fiber state.
//!
//! # Interruption
//!
//! Interruption is a sticky flag on the fiber. While the flag is set and the
//! current region is interruptible, the next `Eval`/`Value` step is replaced
//! by `Halt(Interrupt(by))` and recovery folds are skipped during unwinding,
//! so a handler can never swallow the cancellation. A skipped handler that
//! would have changed the error type turns the typed failures it would have
//! seen into defects. Uninterruptible regions (finalizers, acquisitions) run
//! to completion; the interruption is applied again as soon as control
//! returns to an interruptible region.

use crate::effect::prim::{
    discard_failures, Canceler, Cont, ContOnce, Env, ErasedHalt, HaltCont, HaltMap, Node, Outcome,
    Prim, Register, Value,
};
use crate::runtime::Platform;
use crate::scheduler::Task;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use strand_core::{Cause, Defect, FiberId, Halt};

/// Run user code, converting a panic into a defect.
pub(crate) fn guard<T>(f: impl FnOnce() -> T) -> Result<T, Defect> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(Defect::from_panic)
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

enum Frame {
    Chain(Cont),
    ChainOnce(ContOnce),
    Fold {
        on_halt: HaltCont,
        on_done: Cont,
        same_error: bool,
    },
    MapHalt(HaltMap),
    PopEnv,
    PopInterruptStatus,
}

/// Everything needed to continue a fiber: its continuation stack plus the
/// environment and interrupt-status stacks.
pub(crate) struct RunState {
    stack: Vec<Frame>,
    envs: Vec<Env>,
    interrupt_status: Vec<bool>,
}

impl RunState {
    fn new(env: Env, interruptible: bool) -> Self {
        Self {
            stack: Vec::new(),
            envs: vec![env],
            interrupt_status: vec![interruptible],
        }
    }

    fn interruptible(&self) -> bool {
        self.interrupt_status.last().copied().unwrap_or(true)
    }

    fn env(&self) -> Env {
        match self.envs.last() {
            Some(env) => Arc::clone(env),
            None => Arc::new(()),
        }
    }
}

pub(crate) enum Step {
    Eval(Node),
    Value(Value),
    Halt(ErasedHalt),
}

impl Step {
    fn from_outcome(outcome: Outcome) -> Self {
        match outcome {
            Ok(v) => Step::Value(v),
            Err(h) => Step::Halt(h),
        }
    }

    fn die(defect: Defect) -> Self {
        Step::Halt(Halt::new(Cause::Die(defect)))
    }

    fn eval(f: impl FnOnce() -> Node) -> Self {
        match guard(f) {
            Ok(node) => Step::Eval(node),
            Err(defect) => Step::die(defect),
        }
    }
}

// ---------------------------------------------------------------------------
// Suspension
// ---------------------------------------------------------------------------

enum SuspendState {
    /// `register` is still running.
    Registering,
    /// Parked; the first resume or interrupt takes the run state.
    Waiting {
        run: RunState,
        canceler: Option<Canceler>,
    },
    /// Completed while `register` was still running.
    Early(Outcome),
    Done,
}

pub(crate) struct Suspension {
    state: Mutex<SuspendState>,
    interruptible: bool,
}

impl Suspension {
    fn new(interruptible: bool) -> Self {
        Self {
            state: Mutex::new(SuspendState::Registering),
            interruptible,
        }
    }

    /// Cancel a parked suspension: run its canceler and resume the fiber with
    /// an interruption. No-op unless the fiber is parked here.
    fn interrupt(&self, fiber: &Arc<FiberContext>, by: FiberId) {
        let mut state = self.state.lock();
        let (run, canceler) = match std::mem::replace(&mut *state, SuspendState::Done) {
            SuspendState::Waiting { run, canceler } => (run, canceler),
            other => {
                *state = other;
                return;
            }
        };
        drop(state);

        if let Some(cancel) = canceler {
            if let Err(defect) = guard(cancel) {
                tracing::error!(fiber = %fiber.id, %defect, "canceler panicked");
            }
        }
        fiber.schedule(run, Step::Halt(Halt::new(Cause::Interrupt(by))));
    }
}

/// One-shot completion handle given to an `Async` registration.
///
/// Clones share the same suspension: whichever call comes first wins and the
/// rest are ignored.
#[derive(Clone)]
pub(crate) struct Resumer {
    fiber: Arc<FiberContext>,
    suspension: Arc<Suspension>,
}

impl Resumer {
    /// Complete the suspension, or hand the outcome back if it was already
    /// completed (or interrupted).
    pub(crate) fn try_resume(&self, outcome: Outcome) -> Result<(), Outcome> {
        let mut state = self.suspension.state.lock();
        match std::mem::replace(&mut *state, SuspendState::Done) {
            SuspendState::Registering => {
                *state = SuspendState::Early(outcome);
                Ok(())
            }
            SuspendState::Waiting { run, canceler } => {
                drop(state);
                drop(canceler);
                self.fiber.schedule(run, Step::from_outcome(outcome));
                Ok(())
            }
            previous => {
                *state = previous;
                Err(outcome)
            }
        }
    }

    pub(crate) fn resume(&self, outcome: Outcome) -> bool {
        self.try_resume(outcome).is_ok()
    }

    pub(crate) fn fiber(&self) -> &Arc<FiberContext> {
        &self.fiber
    }
}

// ---------------------------------------------------------------------------
// FiberContext
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FiberState {
    suspension: Option<Arc<Suspension>>,
    exit: Option<Outcome>,
    finished: bool,
    observers: Vec<Box<dyn FnOnce() + Send>>,
}

pub(crate) struct FiberContext {
    id: FiberId,
    platform: Arc<Platform>,
    interrupted: AtomicBool,
    interruptors: Mutex<Vec<FiberId>>,
    state: Mutex<FiberState>,
    /// Attached children, interrupted when this fiber completes.
    children: Mutex<Vec<Weak<FiberContext>>>,
}

impl FiberContext {
    pub(crate) fn new(platform: Arc<Platform>) -> Arc<Self> {
        Arc::new(Self {
            id: FiberId::next(),
            platform,
            interrupted: AtomicBool::new(false),
            interruptors: Mutex::new(Vec::new()),
            state: Mutex::new(FiberState::default()),
            children: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// The first fiber that requested interruption.
    fn interruptor(&self) -> FiberId {
        self.interruptors
            .lock()
            .first()
            .copied()
            .unwrap_or(FiberId::NONE)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Whether the fiber finished with a halt that nobody has taken yet.
    pub(crate) fn peek_failed(&self) -> bool {
        matches!(self.state.lock().exit, Some(Err(_)))
    }

    /// Request cooperative cancellation on behalf of `by`.
    pub(crate) fn interrupt_as(self: &Arc<Self>, by: FiberId) {
        {
            let mut interruptors = self.interruptors.lock();
            if !interruptors.contains(&by) {
                interruptors.push(by);
            }
        }
        if !self.interrupted.swap(true, Ordering::SeqCst) {
            tracing::debug!(fiber = %self.id, by = %by, "interruption requested");
        }
        let suspension = self.state.lock().suspension.clone();
        if let Some(suspension) = suspension {
            if suspension.interruptible {
                suspension.interrupt(self, self.interruptor());
            }
        }
    }

    /// Run `observer` once the fiber has finished (immediately if it has).
    pub(crate) fn on_done(&self, observer: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock();
        if state.finished {
            drop(state);
            observer();
        } else {
            state.observers.push(Box::new(observer));
        }
    }

    /// Take the exit. Only the first observer receives it.
    pub(crate) fn take_exit(&self) -> Outcome {
        let mut state = self.state.lock();
        match state.exit.take() {
            Some(outcome) => outcome,
            None if state.finished => Err(Halt::new(Cause::Die(Defect::runtime(format!(
                "exit of {} was already observed",
                self.id
            ))))),
            None => Err(Halt::new(Cause::Die(Defect::runtime(format!(
                "{} has not finished",
                self.id
            ))))),
        }
    }

    /// Hand an exit back after a waiter that took it could not receive it.
    pub(crate) fn restore_exit(&self, outcome: Outcome) {
        let mut state = self.state.lock();
        if state.exit.is_none() {
            state.exit = Some(outcome);
        }
    }

    // -- lifecycle --------------------------------------------------------

    /// Schedule a fresh fiber running `node`.
    pub(crate) fn start(self: &Arc<Self>, node: Node, env: Env, interruptible: bool) {
        tracing::trace!(fiber = %self.id, "fiber started");
        self.schedule(RunState::new(env, interruptible), Step::Eval(node));
    }

    fn schedule(self: &Arc<Self>, run: RunState, step: Step) {
        let fiber = Arc::clone(self);
        self.platform
            .scheduler
            .spawn(Task::new(self.id, move || fiber.run(run, step)));
    }

    fn fork(self: &Arc<Self>, child: &Node, run: &RunState, daemon: bool) -> Arc<FiberContext> {
        let fiber = FiberContext::new(Arc::clone(&self.platform));
        if !daemon {
            let mut children = self.children.lock();
            if children.len() >= 32 {
                children.retain(|c| c.upgrade().is_some_and(|c| !c.is_finished()));
            }
            children.push(Arc::downgrade(&fiber));
        }
        tracing::trace!(fiber = %fiber.id, parent = %self.id, daemon, "fork");
        fiber.start(child.clone(), run.env(), run.interruptible());
        fiber
    }

    fn complete(self: &Arc<Self>, outcome: Outcome) {
        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            if !child.is_finished() {
                child.interrupt_as(self.id);
            }
        }

        let succeeded = outcome.is_ok();
        let observers = {
            let mut state = self.state.lock();
            state.exit = Some(outcome);
            state.finished = true;
            state.suspension = None;
            std::mem::take(&mut state.observers)
        };
        tracing::trace!(fiber = %self.id, succeeded, "fiber finished");

        for observer in observers {
            if let Err(defect) = guard(observer) {
                tracing::error!(fiber = %self.id, %defect, "exit observer panicked");
            }
        }
    }

    /// Register with an `Async` instruction. Returns the next step when the
    /// outcome arrived during registration, `None` when the fiber parked.
    fn suspend(self: &Arc<Self>, run: RunState, register: &Register) -> Option<(RunState, Step)> {
        let suspension = Arc::new(Suspension::new(run.interruptible()));
        self.state.lock().suspension = Some(Arc::clone(&suspension));
        let resumer = Resumer {
            fiber: Arc::clone(self),
            suspension: Arc::clone(&suspension),
        };

        let registered = guard(|| register(resumer));
        let mut state = suspension.state.lock();
        let previous = std::mem::replace(&mut *state, SuspendState::Done);
        match (registered, previous) {
            (Ok(canceler), SuspendState::Registering) => {
                *state = SuspendState::Waiting {
                    run,
                    canceler: Some(canceler),
                };
                drop(state);
                // An interrupt that arrived during registration found nothing
                // to cancel; apply it now that the fiber is parked.
                if suspension.interruptible && self.is_interrupted() {
                    suspension.interrupt(self, self.interruptor());
                }
                None
            }
            (Ok(canceler), SuspendState::Early(outcome)) => {
                drop(state);
                drop(canceler);
                Some((run, Step::from_outcome(outcome)))
            }
            (Err(defect), _) => {
                drop(state);
                Some((run, Step::die(defect)))
            }
            (Ok(_), _) => {
                drop(state);
                Some((
                    run,
                    Step::die(Defect::runtime("suspension completed twice during registration")),
                ))
            }
        }
    }

    // -- interpreter ------------------------------------------------------

    pub(crate) fn run(self: &Arc<Self>, mut run: RunState, mut step: Step) {
        let budget = self.platform.config.yield_op_count.max(1);
        let mut ops = 0usize;

        loop {
            ops += 1;
            if ops > budget {
                self.schedule(run, step);
                return;
            }

            if run.interruptible() && self.is_interrupted() && !matches!(step, Step::Halt(_)) {
                step = Step::Halt(Halt::new(Cause::Interrupt(self.interruptor())));
            }

            step = match step {
                Step::Value(value) => match run.stack.pop() {
                    None => {
                        self.complete(Ok(value));
                        return;
                    }
                    Some(Frame::Chain(f)) => Step::eval(|| f(value)),
                    Some(Frame::ChainOnce(f)) => Step::eval(|| f(value)),
                    Some(Frame::Fold { on_done, .. }) => Step::eval(|| on_done(value)),
                    Some(Frame::MapHalt(_)) => Step::Value(value),
                    Some(Frame::PopEnv) => {
                        run.envs.pop();
                        Step::Value(value)
                    }
                    Some(Frame::PopInterruptStatus) => {
                        run.interrupt_status.pop();
                        Step::Value(value)
                    }
                },

                Step::Halt(mut halt) => match run.stack.pop() {
                    None => {
                        self.complete(Err(halt));
                        return;
                    }
                    Some(Frame::Chain(_)) | Some(Frame::ChainOnce(_)) => Step::Halt(halt),
                    Some(Frame::Fold {
                        on_halt,
                        same_error,
                        ..
                    }) => {
                        if run.interruptible() && self.is_interrupted() {
                            // Recovery is not allowed to swallow the
                            // interruption.
                            if !same_error {
                                halt = discard_failures(
                                    halt,
                                    "typed failure discarded: its handler was skipped by interruption",
                                );
                            }
                            if !halt.cause.is_interrupted() {
                                let by = self.interruptor();
                                halt.cause = Cause::both(halt.cause, Cause::Interrupt(by));
                            }
                            Step::Halt(halt)
                        } else {
                            Step::eval(|| on_halt(halt))
                        }
                    }
                    Some(Frame::MapHalt(f)) => match guard(|| f(halt)) {
                        Ok(mapped) => Step::Halt(mapped),
                        Err(defect) => Step::die(defect),
                    },
                    Some(Frame::PopEnv) => {
                        run.envs.pop();
                        Step::Halt(halt)
                    }
                    Some(Frame::PopInterruptStatus) => {
                        run.interrupt_status.pop();
                        Step::Halt(halt)
                    }
                },

                Step::Eval(node) => match &*node.0 {
                    Prim::Succeed(f) => match guard(|| f()) {
                        Ok(value) => Step::Value(value),
                        Err(defect) => Step::die(defect),
                    },
                    Prim::Done(slot) => match slot.lock().take() {
                        Some(outcome) => Step::from_outcome(outcome),
                        None => Step::die(Defect::runtime(
                            "one-shot effect evaluated more than once",
                        )),
                    },
                    Prim::Fail(f, location) => {
                        tracing::trace!(fiber = %self.id, %location, "failure raised");
                        match guard(|| f()) {
                            Ok(halt) => Step::Halt(halt),
                            Err(defect) => Step::die(defect),
                        }
                    }
                    Prim::Sync(f) => match guard(|| f()) {
                        Ok(outcome) => Step::from_outcome(outcome),
                        Err(defect) => Step::die(defect),
                    },
                    Prim::Async(register) => match self.suspend(run, register) {
                        Some((resumed, next)) => {
                            run = resumed;
                            next
                        }
                        None => return,
                    },
                    Prim::Chain(first, f) => {
                        run.stack.push(Frame::Chain(Arc::clone(f)));
                        Step::Eval(first.clone())
                    }
                    Prim::ChainOnce(first, slot) => match slot.lock().take() {
                        Some(f) => {
                            run.stack.push(Frame::ChainOnce(f));
                            Step::Eval(first.clone())
                        }
                        None => Step::die(Defect::runtime(
                            "one-shot effect evaluated more than once",
                        )),
                    },
                    Prim::Fold {
                        first,
                        on_halt,
                        on_done,
                        same_error,
                    } => {
                        run.stack.push(Frame::Fold {
                            on_halt: Arc::clone(on_halt),
                            on_done: Arc::clone(on_done),
                            same_error: *same_error,
                        });
                        Step::Eval(first.clone())
                    }
                    Prim::MapHalt(first, f) => {
                        run.stack.push(Frame::MapHalt(Arc::clone(f)));
                        Step::Eval(first.clone())
                    }
                    Prim::Fork { child, daemon } => {
                        let fiber = self.fork(child, &run, *daemon);
                        Step::Value(Box::new(fiber))
                    }
                    Prim::Suspend(f) => Step::eval(|| f()),
                    Prim::Access(f) => {
                        let env = run.env();
                        Step::eval(|| f(&env))
                    }
                    Prim::Provide(env, inner) => {
                        run.envs.push(Arc::clone(env));
                        run.stack.push(Frame::PopEnv);
                        Step::Eval(inner.clone())
                    }
                    Prim::SetInterruptible(flag, inner) => {
                        run.interrupt_status.push(*flag);
                        run.stack.push(Frame::PopInterruptStatus);
                        Step::Eval(inner.clone())
                    }
                    Prim::InterruptStatus(f) => {
                        let status = run.interruptible();
                        Step::eval(|| f(status))
                    }
                    Prim::Descriptor(f) => Step::eval(|| f(self)),
                    Prim::Yield => {
                        self.schedule(run, Step::Value(Box::new(())));
                        return;
                    }
                },
            };
        }
    }
}
