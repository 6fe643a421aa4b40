//! `Queue<A>`: a FIFO channel between fibers with backpressure and shutdown.
//!
//! `offer` suspends the calling fiber while a bounded queue is full and
//! `take` suspends while it is empty. Suspended offerers and takers are
//! served in arrival order. A waiter that is interrupted while blocked is
//! removed from its list and never receives (or loses) an element.
//!
//! `shutdown` completes every blocked and every future operation with
//! `Cause::Interrupt(caller)` and discards buffered elements.
//!
//! Lock order: queue state, then a waiter's suspension.

use crate::effect::prim::{ErasedHalt, Node, Outcome, Prim, Value};
use crate::effect::{Canceler, Effect};
use crate::fiber::context::Resumer;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use strand_core::{Cause, FiberId, Halt};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("a bounded queue needs a capacity of at least 1")]
    ZeroCapacity,
}

struct State<A> {
    buffer: VecDeque<A>,
    takers: VecDeque<(u64, Resumer)>,
    offerers: VecDeque<(u64, A, Resumer)>,
    shutdown: Option<FiberId>,
    shutdown_waiters: Vec<(u64, Resumer)>,
    next_waiter: u64,
}

struct Inner<A> {
    capacity: Option<usize>,
    state: Mutex<State<A>>,
}

pub struct Queue<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Queue")
            .field("capacity", &self.inner.capacity)
            .field("buffered", &state.buffer.len())
            .field("takers", &state.takers.len())
            .field("offerers", &state.offerers.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

fn interrupted(by: FiberId) -> ErasedHalt {
    Halt::new(Cause::Interrupt(by))
}

fn unit() -> Outcome {
    Ok(Box::new(()))
}

fn noop() -> Canceler {
    Box::new(|| {})
}

/// Recover an element whose hand-off to a waiter was refused.
fn reclaim<A: 'static>(refused: Outcome) -> Option<A> {
    match refused {
        Ok(value) => value.downcast::<A>().ok().map(|boxed| *boxed),
        Err(_) => None,
    }
}

impl<A> State<A>
where
    A: Send + 'static,
{
    fn next_id(&mut self) -> u64 {
        self.next_waiter += 1;
        self.next_waiter
    }

    /// Give `item` to the longest-waiting taker. Hands it back if every
    /// taker has already gone.
    fn hand_off(&mut self, mut item: A) -> Result<(), A> {
        while let Some((_, taker)) = self.takers.pop_front() {
            match taker.try_resume(Ok(Box::new(item) as Value)) {
                Ok(()) => return Ok(()),
                Err(refused) => match reclaim(refused) {
                    Some(back) => item = back,
                    None => return Ok(()),
                },
            }
        }
        Err(item)
    }

    /// Pop the next element, then admit the longest-waiting offerer whose
    /// fiber is still blocked.
    fn pop(&mut self) -> Option<A> {
        let item = self.buffer.pop_front()?;
        while let Some((_, pending, offerer)) = self.offerers.pop_front() {
            if offerer.resume(unit()) {
                self.buffer.push_back(pending);
                break;
            }
        }
        Some(item)
    }
}

impl<A> Queue<A>
where
    A: Send + 'static,
{
    /// A queue holding at most `capacity` elements.
    pub fn bounded(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        Ok(Self::with_capacity(Some(capacity)))
    }

    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity,
                state: Mutex::new(State {
                    buffer: VecDeque::new(),
                    takers: VecDeque::new(),
                    offerers: VecDeque::new(),
                    shutdown: None,
                    shutdown_waiters: Vec::new(),
                    next_waiter: 0,
                }),
            }),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    fn has_room(&self, state: &State<A>) -> bool {
        self.inner.capacity.map_or(true, |cap| state.buffer.len() < cap)
    }

    /// Remove a waiter when its fiber is interrupted.
    fn cancel_with(&self, remove: impl FnOnce(&mut State<A>) + Send + 'static) -> Canceler {
        let weak: Weak<Inner<A>> = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                remove(&mut inner.state.lock());
            }
        })
    }

    fn suspend<R, E, T>(
        &self,
        register: impl Fn(&Queue<A>, Resumer) -> Canceler + Send + Sync + 'static,
    ) -> Effect<R, E, T>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
        T: Send + 'static,
    {
        let queue = self.clone();
        Effect::from_node(Node::new(Prim::Async(Arc::new(move |resumer: Resumer| {
            register(&queue, resumer)
        }))))
    }

    fn now<R, E, T>(&self, f: impl Fn(&mut State<A>) -> Result<T, ErasedHalt> + Send + Sync + 'static) -> Effect<R, E, T>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
        T: Send + 'static,
    {
        let queue = self.clone();
        Effect::from_node(Node::new(Prim::Sync(Arc::new(move || {
            f(&mut queue.inner.state.lock()).map(|t| Box::new(t) as Value)
        }))))
    }

    // -- operations -------------------------------------------------------

    /// Add an element, suspending while the queue is full.
    pub fn offer<R, E>(&self, item: A) -> Effect<R, E, ()>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
        A: Clone + Sync,
    {
        self.suspend(move |queue, resumer| {
            let mut state = queue.inner.state.lock();
            if let Some(by) = state.shutdown {
                resumer.resume(Err(interrupted(by)));
                return noop();
            }
            let item = match state.hand_off(item.clone()) {
                Ok(()) => {
                    resumer.resume(unit());
                    return noop();
                }
                Err(item) => item,
            };
            if queue.has_room(&state) {
                state.buffer.push_back(item);
                resumer.resume(unit());
                return noop();
            }
            let id = state.next_id();
            state.offerers.push_back((id, item, resumer));
            tracing::trace!(waiter = id, "offer suspended on a full queue");
            queue.cancel_with(move |state| state.offerers.retain(|(w, _, _)| *w != id))
        })
    }

    /// Remove the oldest element, suspending while the queue is empty.
    pub fn take<R, E>(&self) -> Effect<R, E, A>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
    {
        self.suspend(|queue, resumer| {
            let mut state = queue.inner.state.lock();
            if let Some(by) = state.shutdown {
                resumer.resume(Err(interrupted(by)));
                return noop();
            }
            if let Some(item) = state.pop() {
                resumer.resume(Ok(Box::new(item)));
                return noop();
            }
            let id = state.next_id();
            state.takers.push_back((id, resumer));
            tracing::trace!(waiter = id, "take suspended on an empty queue");
            queue.cancel_with(move |state| state.takers.retain(|(w, _)| *w != id))
        })
    }

    /// Remove the oldest element if there is one, without suspending.
    pub fn poll<R, E>(&self) -> Effect<R, E, Option<A>>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
    {
        self.now(|state| match state.shutdown {
            Some(by) => Err(interrupted(by)),
            None => Ok(state.pop()),
        })
    }

    /// Remove up to `max` elements without suspending.
    pub fn take_up_to<R, E>(&self, max: usize) -> Effect<R, E, Vec<A>>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
    {
        self.now(move |state| {
            if let Some(by) = state.shutdown {
                return Err(interrupted(by));
            }
            let mut out = Vec::new();
            while out.len() < max {
                match state.pop() {
                    Some(item) => out.push(item),
                    None => break,
                }
            }
            Ok(out)
        })
    }

    pub fn take_all<R, E>(&self) -> Effect<R, E, Vec<A>>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
    {
        self.take_up_to(usize::MAX)
    }

    /// Buffered elements plus elements held by suspended offerers.
    pub fn size<R, E>(&self) -> Effect<R, E, usize>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
    {
        self.now(|state| match state.shutdown {
            Some(by) => Err(interrupted(by)),
            None => Ok(state.buffer.len() + state.offerers.len()),
        })
    }

    pub fn is_shutdown<R, E>(&self) -> Effect<R, E, bool>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
    {
        self.now(|state| Ok(state.shutdown.is_some()))
    }

    /// Shut the queue down on behalf of the calling fiber. Idempotent.
    pub fn shutdown<R, E>(&self) -> Effect<R, E, ()>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
    {
        let queue = self.clone();
        Effect::from_node(Node::descriptor(move |fiber| {
            queue.shutdown_as(fiber.id());
            Node::unit()
        }))
    }

    fn shutdown_as(&self, by: FiberId) {
        let (takers, offerers, waiters, discarded) = {
            let mut state = self.inner.state.lock();
            if state.shutdown.is_some() {
                return;
            }
            state.shutdown = Some(by);
            (
                std::mem::take(&mut state.takers),
                std::mem::take(&mut state.offerers),
                std::mem::take(&mut state.shutdown_waiters),
                std::mem::take(&mut state.buffer),
            )
        };
        tracing::debug!(
            by = %by,
            takers = takers.len(),
            offerers = offerers.len(),
            discarded = discarded.len(),
            "queue shut down"
        );
        for (_, taker) in takers {
            taker.resume(Err(interrupted(by)));
        }
        for (_, _, offerer) in offerers {
            offerer.resume(Err(interrupted(by)));
        }
        for (_, waiter) in waiters {
            waiter.resume(unit());
        }
    }

    /// Suspend until the queue is shut down.
    pub fn await_shutdown<R, E>(&self) -> Effect<R, E, ()>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
    {
        self.suspend(|queue, resumer| {
            let mut state = queue.inner.state.lock();
            if state.shutdown.is_some() {
                resumer.resume(unit());
                return noop();
            }
            let id = state.next_id();
            state.shutdown_waiters.push((id, resumer));
            queue.cancel_with(move |state| state.shutdown_waiters.retain(|(w, _)| *w != id))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
