//! Work-stealing worker pool that runs fiber slices.
//!
//! Every worker owns a FIFO deque. Runnable fibers are pushed onto a shared
//! [`Injector`]; a worker looks for work in its own deque first, then takes a
//! batch from the injector, then steals from a peer picked at random. When
//! all three come up empty it parks for at most a millisecond.
//!
//! A fiber holds a worker only while it takes synchronous steps. When it
//! suspends its task returns, and resuming it submits a new [`Task`].

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::iter;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use strand_core::{Defect, FiberId};

/// One slice of a fiber's execution: run until it suspends, yields or ends.
pub struct Task {
    fiber: FiberId,
    work: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    pub fn new(fiber: FiberId, work: impl FnOnce() + Send + 'static) -> Self {
        Self {
            fiber,
            work: Box::new(work),
        }
    }

    pub fn fiber(&self) -> FiberId {
        self.fiber
    }

    fn run(self) {
        (self.work)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("fiber", &self.fiber).finish_non_exhaustive()
    }
}

/// State every worker can reach.
struct Shared {
    injector: Injector<Task>,
    stealers: Vec<Stealer<Task>>,
    shutdown: AtomicBool,
}

/// A fixed pool of worker threads.
pub struct Scheduler {
    shared: Arc<Shared>,
    /// Unparked round-robin when work is injected.
    threads: Vec<thread::Thread>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    next_unpark: AtomicUsize,
}

impl Scheduler {
    /// Start `workers` threads named `{name_prefix}-{index}`. Zero means one
    /// per available CPU.
    pub fn new(workers: usize, name_prefix: &str) -> io::Result<Self> {
        let workers = if workers == 0 {
            num_cpus::get().max(1)
        } else {
            workers
        };

        let locals: Vec<Worker<Task>> = (0..workers).map(|_| Worker::new_fifo()).collect();
        let shared = Arc::new(Shared {
            injector: Injector::new(),
            stealers: locals.iter().map(Worker::stealer).collect(),
            shutdown: AtomicBool::new(false),
        });

        let mut handles: Vec<thread::JoinHandle<()>> = Vec::with_capacity(workers);
        for (index, local) in locals.into_iter().enumerate() {
            let worker = WorkerThread {
                index,
                local,
                shared: Arc::clone(&shared),
                rng: (index as u32).wrapping_mul(2_654_435_761).max(1),
            };
            let spawned = thread::Builder::new()
                .name(format!("{name_prefix}-{index}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    shared.shutdown.store(true, Ordering::Release);
                    for handle in handles {
                        handle.thread().unpark();
                        let _ = handle.join();
                    }
                    return Err(err);
                }
            }
        }

        tracing::debug!(workers, "scheduler started");
        Ok(Self {
            shared,
            threads: handles.iter().map(|h| h.thread().clone()).collect(),
            handles: Mutex::new(handles),
            next_unpark: AtomicUsize::new(0),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.threads.len()
    }

    /// Queue `task` and wake a worker. After shutdown the task is dropped
    /// without running.
    pub fn spawn(&self, task: Task) {
        if self.is_shutdown() {
            tracing::trace!(fiber = %task.fiber, "task dropped after shutdown");
            return;
        }
        self.shared.injector.push(task);
        if let Some(thread) = self.next_thread() {
            thread.unpark();
        }
    }

    fn next_thread(&self) -> Option<&thread::Thread> {
        if self.threads.is_empty() {
            return None;
        }
        let idx = self.next_unpark.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        self.threads.get(idx)
    }

    /// Stop the workers and wait for them. Tasks that were still queued are
    /// left for [`Scheduler::drain`]. A worker calling this does not wait for
    /// itself.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for thread in &self.threads {
            thread.unpark();
        }
        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        tracing::debug!("scheduler stopped");
    }

    /// Drop every task still in the injector and return how many there were.
    pub fn drain(&self) -> usize {
        iter::from_fn(|| loop {
            match self.shared.injector.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Retry => continue,
                Steal::Empty => return None,
            }
        })
        .count()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
        self.drain();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.worker_count())
            .field("queued", &self.shared.injector.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// The loop one worker thread runs.
struct WorkerThread {
    index: usize,
    local: Worker<Task>,
    shared: Arc<Shared>,
    /// xorshift32 state for picking a peer; never zero.
    rng: u32,
}

impl WorkerThread {
    fn run(mut self) {
        tracing::trace!(worker = self.index, "worker started");
        while !self.shared.shutdown.load(Ordering::Acquire) {
            match self.find_task() {
                Some(task) => execute(task),
                // `spawn` unparks us; the timeout covers a wake-up that raced
                // with the search.
                None => thread::park_timeout(Duration::from_millis(1)),
            }
        }
        // Abandoned tasks hold fibers, which hold the runtime.
        while self.local.pop().is_some() {}
        tracing::trace!(worker = self.index, "worker stopped");
    }

    fn find_task(&mut self) -> Option<Task> {
        if let Some(task) = self.local.pop() {
            return Some(task);
        }
        iter::repeat_with(|| {
            self.shared
                .injector
                .steal_batch_and_pop(&self.local)
                .or_else(|| self.steal_from_peer())
        })
        .find(|steal| !steal.is_retry())
        .and_then(Steal::success)
    }

    fn steal_from_peer(&mut self) -> Steal<Task> {
        let peers = self.shared.stealers.len();
        if peers < 2 {
            return Steal::Empty;
        }
        let start = self.next_random() as usize % peers;
        (0..peers)
            .map(|offset| (start + offset) % peers)
            .filter(|&peer| peer != self.index)
            .map(|peer| self.shared.stealers[peer].steal_batch_and_pop(&self.local))
            .collect()
    }

    fn next_random(&mut self) -> u32 {
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng = x;
        x
    }
}

/// Run a task on the current worker. The interpreter catches panics in user
/// code; one that escapes it is logged and the worker carries on.
fn execute(task: Task) {
    let fiber = task.fiber;
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || task.run())) {
        let defect = Defect::from_panic(payload);
        tracing::error!(fiber = %fiber, %defect, "task panicked outside the interpreter");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_for(counter: &AtomicUsize, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while counter.load(Ordering::Relaxed) < n && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Task {
        let counter = Arc::clone(counter);
        Task::new(FiberId::next(), move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn starts_the_requested_workers() {
        let sched = Scheduler::new(2, "test-worker").unwrap();
        assert_eq!(sched.worker_count(), 2);
        sched.shutdown();
    }

    #[test]
    fn zero_workers_means_one_per_cpu() {
        let sched = Scheduler::new(0, "test-worker").unwrap();
        assert!(sched.worker_count() >= 1);
    }

    #[test]
    fn runs_every_task_across_workers() {
        let sched = Scheduler::new(4, "test-worker").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..1_000 {
            sched.spawn(counting(&counter));
        }
        wait_for(&counter, 1_000);
        sched.shutdown();
        assert_eq!(counter.load(Ordering::Relaxed), 1_000);
    }

    #[test]
    fn tasks_can_resubmit_work() {
        let sched = Arc::new(Scheduler::new(2, "test-worker").unwrap());
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let inner = Arc::clone(&sched);
            let next = counting(&counter);
            sched.spawn(Task::new(FiberId::next(), move || inner.spawn(next)));
        }
        wait_for(&counter, 10);
        assert_eq!(counter.load(Ordering::Relaxed), 10);
        sched.shutdown();
    }

    #[test]
    fn a_panicking_task_does_not_stop_its_worker() {
        let sched = Scheduler::new(1, "test-worker").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        sched.spawn(Task::new(FiberId::next(), || panic!("task blew up")));
        sched.spawn(counting(&counter));
        wait_for(&counter, 1);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let sched = Scheduler::new(1, "test-worker").unwrap();
        sched.shutdown();
        assert!(sched.is_shutdown());
        sched.shutdown();
        assert!(sched.is_shutdown());
    }

    #[test]
    fn spawn_after_shutdown_drops_the_task() {
        let sched = Scheduler::new(1, "test-worker").unwrap();
        sched.shutdown();
        let counter = Arc::new(AtomicUsize::new(0));
        sched.spawn(counting(&counter));
        assert_eq!(sched.drain(), 0);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn debug_names_the_fiber_and_the_pool_state() {
        let fiber = FiberId::next();
        let task = Task::new(fiber, || {});
        assert_eq!(task.fiber(), fiber);
        assert!(format!("{task:?}").contains(&format!("{fiber:?}")));

        let sched = Scheduler::new(1, "test-worker").unwrap();
        sched.shutdown();
        let dbg = format!("{sched:?}");
        assert!(dbg.contains("workers: 1"));
        assert!(dbg.contains("shutdown: true"));
    }
}
