//! The closed instruction set interpreted by a fiber.
//!
//! Every [`Effect`](super::Effect) is a thin typed wrapper around a [`Node`].
//! Inside the interpreter values, failures and environments are type-erased;
//! the typed layer is the only producer of nodes, so a downcast failure means
//! a runtime bug and is reported as a defect rather than a panic.

use crate::fiber::context::{FiberContext, Resumer};
use parking_lot::Mutex;
use std::any::{type_name, Any, TypeId};
use std::panic::Location;
use std::sync::Arc;
use strand_core::{Cause, Defect, Exit, Halt};

pub(crate) type Value = Box<dyn Any + Send>;
pub(crate) type Env = Arc<dyn Any + Send + Sync>;
pub(crate) type ErasedHalt = Halt<Value>;
/// What a step produced: a value or a halt.
pub(crate) type Outcome = Result<Value, ErasedHalt>;

/// Cancellation action returned by an asynchronous registration. Invoked at
/// most once, when the suspended fiber is interrupted.
pub type Canceler = Box<dyn FnOnce() + Send + 'static>;

pub(crate) type Cont = Arc<dyn Fn(Value) -> Node + Send + Sync>;
pub(crate) type ContOnce = Box<dyn FnOnce(Value) -> Node + Send>;
pub(crate) type HaltCont = Arc<dyn Fn(ErasedHalt) -> Node + Send + Sync>;
pub(crate) type HaltMap = Arc<dyn Fn(ErasedHalt) -> ErasedHalt + Send + Sync>;
pub(crate) type Register = Arc<dyn Fn(Resumer) -> Canceler + Send + Sync>;

pub(crate) enum Prim {
    Succeed(Arc<dyn Fn() -> Value + Send + Sync>),
    /// A value or halt produced while running; may be evaluated once.
    Done(Mutex<Option<Outcome>>),
    Fail(
        Arc<dyn Fn() -> ErasedHalt + Send + Sync>,
        &'static Location<'static>,
    ),
    Sync(Arc<dyn Fn() -> Outcome + Send + Sync>),
    Async(Register),
    Chain(Node, Cont),
    ChainOnce(Node, Mutex<Option<ContOnce>>),
    /// Recovery point. `same_error` is true when the handler's error type is
    /// the one it recovers from.
    Fold {
        first: Node,
        on_halt: HaltCont,
        on_done: Cont,
        same_error: bool,
    },
    /// Total rewrite of a halt (error mapping). Never skipped.
    MapHalt(Node, HaltMap),
    Fork {
        child: Node,
        daemon: bool,
    },
    Suspend(Arc<dyn Fn() -> Node + Send + Sync>),
    Access(Arc<dyn Fn(&Env) -> Node + Send + Sync>),
    Provide(Env, Node),
    SetInterruptible(bool, Node),
    InterruptStatus(Arc<dyn Fn(bool) -> Node + Send + Sync>),
    Descriptor(Arc<dyn Fn(&Arc<FiberContext>) -> Node + Send + Sync>),
    Yield,
}

/// A shared, immutable instruction.
#[derive(Clone)]
pub(crate) struct Node(pub(crate) Arc<Prim>);

impl Node {
    pub(crate) fn new(prim: Prim) -> Self {
        Node(Arc::new(prim))
    }

    pub(crate) fn outcome(outcome: Outcome) -> Self {
        Node::new(Prim::Done(Mutex::new(Some(outcome))))
    }

    pub(crate) fn value(value: Value) -> Self {
        Node::outcome(Ok(value))
    }

    pub(crate) fn halt(halt: ErasedHalt) -> Self {
        Node::outcome(Err(halt))
    }

    pub(crate) fn die(defect: Defect) -> Self {
        Node::halt(Halt::new(Cause::Die(defect)))
    }

    pub(crate) fn unit() -> Self {
        Node::new(Prim::Succeed(Arc::new(|| Box::new(()) as Value)))
    }

    pub(crate) fn chain(self, f: impl Fn(Value) -> Node + Send + Sync + 'static) -> Self {
        Node::new(Prim::Chain(self, Arc::new(f)))
    }

    pub(crate) fn chain_once(self, f: impl FnOnce(Value) -> Node + Send + 'static) -> Self {
        Node::new(Prim::ChainOnce(self, Mutex::new(Some(Box::new(f)))))
    }

    pub(crate) fn descriptor(
        f: impl Fn(&Arc<FiberContext>) -> Node + Send + Sync + 'static,
    ) -> Self {
        Node::new(Prim::Descriptor(Arc::new(f)))
    }

    pub(crate) fn set_interruptible(self, interruptible: bool) -> Self {
        Node::new(Prim::SetInterruptible(interruptible, self))
    }
}

// ---------------------------------------------------------------------------
// Erasure helpers
// ---------------------------------------------------------------------------

pub(crate) fn mismatch<T>(what: &str) -> Defect {
    Defect::runtime(format!("{what} type mismatch: expected {}", type_name::<T>()))
}

pub(crate) fn downcast<A: 'static>(value: Value) -> Result<A, ErasedHalt> {
    value
        .downcast::<A>()
        .map(|boxed| *boxed)
        .map_err(|_| Halt::new(Cause::Die(mismatch::<A>("value"))))
}

/// Continue with `f(value)` after downcasting, or halt with a defect.
pub(crate) fn with_value<A: 'static>(value: Value, f: impl FnOnce(A) -> Node) -> Node {
    match downcast::<A>(value) {
        Ok(a) => f(a),
        Err(halt) => Node::halt(halt),
    }
}

pub(crate) fn erase_halt<E: Send + 'static>(halt: Halt<E>) -> ErasedHalt {
    halt.map(|e| Box::new(e) as Value)
}

pub(crate) fn unerase_halt<E: 'static>(halt: ErasedHalt) -> Halt<E> {
    halt.flat_map_fail(&mut |v: Value| match v.downcast::<E>() {
        Ok(e) => Cause::Fail(*e),
        Err(_) => Cause::Die(mismatch::<E>("failure")),
    })
}

/// Re-label a halt of error type `E` as one of error type `E2`. Typed
/// failures survive only when the types agree; otherwise each one becomes a
/// runtime defect naming the type it had, so the halt keeps every leaf.
pub(crate) fn retype_halt<E: 'static, E2: 'static>(halt: ErasedHalt) -> ErasedHalt {
    if TypeId::of::<E>() == TypeId::of::<E2>() {
        return halt;
    }
    let reason = format!(
        "typed failure of {} cannot be held by a handler of {}",
        type_name::<E>(),
        type_name::<E2>()
    );
    discard_failures(halt, &reason)
}

/// Replace every typed failure in `halt` with a runtime defect.
pub(crate) fn discard_failures(halt: ErasedHalt, reason: &str) -> ErasedHalt {
    halt.flat_map_fail(&mut |_| Cause::Die(Defect::runtime(reason)))
}

pub(crate) fn erase_exit<E: Send + 'static, A: Send + 'static>(exit: Exit<E, A>) -> Outcome {
    match exit {
        Exit::Done(a) => Ok(Box::new(a)),
        Exit::Halt(h) => Err(erase_halt(h)),
    }
}

pub(crate) fn unerase_outcome<E: 'static, A: 'static>(outcome: Outcome) -> Exit<E, A> {
    match outcome {
        Ok(v) => match downcast::<A>(v) {
            Ok(a) => Exit::Done(a),
            Err(h) => Exit::Halt(unerase_halt(h)),
        },
        Err(h) => Exit::Halt(unerase_halt(h)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
