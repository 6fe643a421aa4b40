//! Deadline timer backing `sleep`, `delay` and `timeout`.
//!
//! One background thread owns a min-heap of deadlines and sleeps on a
//! condition variable until the earliest one is due. Callbacks run on the
//! timer thread and must be short: in practice they only resume a suspended
//! fiber, which re-submits it to the scheduler.

use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use strand_core::Defect;

/// Handle used to cancel a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct TimerState {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    callbacks: HashMap<u64, Callback>,
    next_key: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

pub struct Timer {
    shared: Arc<Shared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Timer {
    pub fn new(thread_name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::default()),
            wakeup: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || Self::run(&worker))?;
        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Run `callback` on the timer thread once `deadline` has passed.
    ///
    /// After shutdown the callback is dropped without running.
    pub fn schedule<F>(&self, deadline: Instant, callback: F) -> TimerKey
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        let key = state.next_key;
        state.next_key += 1;
        if state.shutdown {
            return TimerKey(key);
        }
        state.deadlines.push(Reverse((deadline, key)));
        state.callbacks.insert(key, Box::new(callback));
        self.shared.wakeup.notify_one();
        TimerKey(key)
    }

    /// Cancel a pending callback. Returns `false` if it already ran or was
    /// cancelled.
    pub fn cancel(&self, key: TimerKey) -> bool {
        // The heap entry stays behind and is skipped when it comes due.
        self.shared.state.lock().callbacks.remove(&key.0).is_some()
    }

    /// Number of callbacks still pending.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().callbacks.len()
    }

    /// Stop the timer thread and drop every pending callback.
    pub fn shutdown(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.deadlines.clear();
            std::mem::take(&mut state.callbacks)
        };
        self.shared.wakeup.notify_all();
        // Pending callbacks may own the last reference to the runtime; drop
        // them outside the lock.
        drop(dropped);
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn run(shared: &Shared) {
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(Reverse((deadline, key))) = state.deadlines.peek().copied() {
                if deadline > now {
                    break;
                }
                state.deadlines.pop();
                if let Some(cb) = state.callbacks.remove(&key) {
                    due.push(cb);
                }
            }

            if !due.is_empty() {
                drop(state);
                for cb in due {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(cb)) {
                        let defect = Defect::from_panic(payload);
                        tracing::error!(%defect, "timer callback panicked");
                    }
                }
                state = shared.state.lock();
                continue;
            }

            match state.deadlines.peek().copied() {
                Some(Reverse((deadline, _))) => {
                    shared.wakeup.wait_until(&mut state, deadline);
                }
                None => shared.wakeup.wait(&mut state),
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::time::Duration;

    #[test]
    fn callbacks_fire_in_deadline_order() {
        let timer = Timer::new("test-timer").unwrap();
        let (tx, rx) = bounded(3);
        let now = Instant::now();
        for (ms, tag) in [(30u64, "c"), (10, "a"), (20, "b")] {
            let tx = tx.clone();
            timer.schedule(now + Duration::from_millis(ms), move || {
                let _ = tx.send(tag);
            });
        }
        let got: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[test]
    fn cancelled_callback_never_runs() {
        let timer = Timer::new("test-timer").unwrap();
        let (tx, rx) = bounded(1);
        let key = timer.schedule(Instant::now() + Duration::from_millis(20), move || {
            let _ = tx.send(());
        });
        assert!(timer.cancel(key));
        assert!(!timer.cancel(key));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn shutdown_drops_pending_callbacks() {
        let timer = Timer::new("test-timer").unwrap();
        timer.schedule(Instant::now() + Duration::from_secs(60), || {});
        assert_eq!(timer.pending(), 1);
        timer.shutdown();
        assert_eq!(timer.pending(), 0);
        timer.schedule(Instant::now(), || {});
        assert_eq!(timer.pending(), 0);
    }
}
