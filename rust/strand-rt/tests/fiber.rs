//! Integration tests for fibers: fork/join, interruption, supervision and
//! the parallel combinators.

use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand_rt::prelude::*;

type Io<A> = Effect<(), String, A>;

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig {
        worker_threads: 2,
        ..RuntimeConfig::default()
    })
    .unwrap()
}

/// Poll `flag` until it is set or a second has passed.
fn eventually(flag: &Ref<bool>) -> bool {
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        if *flag.get_now() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// A child that signals `ready` once its interruption handler is in place,
/// then blocks forever.
fn blocked_child(ready: &Queue<()>, interrupted: &Ref<bool>) -> Io<()> {
    ready
        .offer(())
        .zip_right(Io::never())
        .on_interrupt(interrupted.set(true))
}

// ===========================================================================
// Fork and join
// ===========================================================================

#[test]
fn fork_then_join_returns_the_value() {
    let rt = runtime();
    let program = Io::succeed(5).fork::<String>().chain(|fiber| fiber.join());
    assert_eq!(rt.run(program, ()), Exit::done(5));
}

#[test]
fn join_adopts_the_child_failure() {
    let rt = runtime();
    let program = Io::<i32>::fail("child".into())
        .fork::<String>()
        .chain(|fiber| fiber.join());
    assert_eq!(rt.run(program, ()), Exit::fail("child".to_string()));
}

#[test]
fn second_join_reports_the_exit_was_observed() {
    let rt = runtime();
    let program = Io::succeed(5)
        .fork::<String>()
        .chain(|fiber| fiber.join().zip_right(fiber.join().result::<String>()));
    let second = rt.run(program, ()).into_result().unwrap();
    let cause = second.cause().unwrap();
    assert!(cause.is_die());
    assert!(cause.defects()[0].message().contains("already observed"));
}

#[test]
fn fibers_have_distinct_ids() {
    let rt = runtime();
    let child_id = Effect::<(), String, FiberId>::fiber_id()
        .fork::<String>()
        .chain(|fiber| fiber.join());
    let program = Effect::<(), String, FiberId>::fiber_id().zip(child_id);
    let (parent, child) = rt.run(program, ()).into_result().unwrap();
    assert_ne!(parent, child);
    assert!(!parent.is_none());
}

#[test]
fn runtime_fork_can_be_joined_later() {
    let rt = runtime();
    let fiber = rt.fork(Io::succeed(7).delay(Duration::from_millis(10)), ());
    assert_eq!(rt.run(fiber.join::<()>(), ()), Exit::done(7));
    assert!(fiber.is_finished());
}

#[test]
fn run_async_delivers_the_exit() {
    let rt = runtime();
    let (tx, rx) = crossbeam_channel::bounded(1);
    rt.run_async(Io::succeed(3), (), move |exit| {
        let _ = tx.send(exit);
    });
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Exit::done(3));
}

// ===========================================================================
// Interruption
// ===========================================================================

#[test]
fn interrupting_a_blocked_fiber_names_the_interruptor() {
    let rt = runtime();
    let program = Io::<()>::never()
        .fork::<String>()
        .chain(|fiber| fiber.interrupt::<(), String>())
        .zip(Effect::fiber_id());
    let (exit, me) = rt.run(program, ()).into_result().unwrap();
    assert!(exit.is_interrupted());
    assert!(exit.cause().unwrap().interruptors().contains(&me));
}

#[test]
fn interrupt_runs_finalizers_before_returning() {
    let rt = runtime();
    let ready = Queue::unbounded();
    let interrupted = Ref::new(false);
    let released = Ref::new(false);
    let child = blocked_child(&ready, &interrupted).ensuring(released.set(true));
    let waiting = ready.clone();
    let program = child
        .fork::<String>()
        .chain(move |fiber| waiting.take().zip_right(fiber.interrupt::<(), String>()));
    let exit = rt.run(program, ()).into_result().unwrap();
    assert!(exit.is_interrupted());
    assert!(*interrupted.get_now());
    assert!(*released.get_now());
}

#[test]
fn interrupt_runs_the_async_canceler() {
    let rt = runtime();
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);
    let ready = Queue::unbounded();
    let signal = ready.clone();
    let child = signal.offer(()).zip_right(Io::<()>::async_interrupt(move |_| {
        let flag = Arc::clone(&flag);
        Box::new(move || flag.store(true, Ordering::SeqCst))
    }));
    let program = child.fork::<String>().chain(move |fiber| {
        ready
            .take()
            .zip_right(Io::unit().delay(Duration::from_millis(10)))
            .zip_right(fiber.interrupt::<(), String>())
    });
    assert!(rt.run(program, ()).into_result().unwrap().is_interrupted());
    assert!(cancelled.load(Ordering::SeqCst));
}

#[test]
fn uninterruptible_region_runs_to_completion() {
    let rt = runtime();
    let ready = Queue::unbounded();
    let finished = Ref::new(false);
    let child = ready
        .offer::<(), String>(())
        .zip_right(finished.set(true).delay(Duration::from_millis(30)))
        .uninterruptible();
    let waiting = ready.clone();
    let program = child
        .fork::<String>()
        .chain(move |fiber| waiting.take().zip_right(fiber.interrupt::<(), String>()));
    assert!(rt.run(program, ()).is_done());
    assert!(*finished.get_now());
}

#[test]
fn restore_keeps_the_masked_part_interruptible() {
    let rt = runtime();
    let ready = Queue::unbounded();
    let signal = ready.clone();
    let child = Io::<()>::uninterruptible_mask(move |restore| {
        signal.offer(()).zip_right(restore.apply(Io::never()))
    });
    let program = child
        .fork::<String>()
        .chain(move |fiber| ready.take().zip_right(fiber.interrupt::<(), String>()));
    let exit = rt.run(program, ()).into_result().unwrap();
    assert!(exit.is_interrupted());
}

#[test]
fn interrupting_a_finished_fiber_returns_its_exit() {
    let rt = runtime();
    let program = Io::succeed(3).fork::<String>().chain(|fiber| {
        Io::unit()
            .delay(Duration::from_millis(10))
            .zip_right(fiber.interrupt::<(), String>())
    });
    assert_eq!(rt.run(program, ()), Exit::done(Exit::done(3)));
}

#[test]
fn interrupt_fork_does_not_wait() {
    let rt = runtime();
    let ready = Queue::unbounded();
    let interrupted = Ref::new(false);
    let waiting = ready.clone();
    let program = blocked_child(&ready, &interrupted)
        .fork::<String>()
        .chain(move |fiber| waiting.take().zip_right(fiber.interrupt_fork::<(), String>()));
    assert_eq!(rt.run(program, ()), Exit::done(()));
    assert!(eventually(&interrupted));
}

// ===========================================================================
// Supervision
// ===========================================================================

#[test]
fn parent_completion_interrupts_attached_children() {
    let rt = runtime();
    let ready = Queue::unbounded();
    let interrupted = Ref::new(false);
    let waiting = ready.clone();
    let program = blocked_child(&ready, &interrupted)
        .fork::<String>()
        .zip_left(waiting.take());
    assert!(rt.run(program, ()).is_done());
    assert!(eventually(&interrupted));
}

#[test]
fn daemon_children_outlive_their_parent() {
    let rt = runtime();
    let finished = Ref::new(false);
    let program = finished
        .set::<(), String>(true)
        .delay(Duration::from_millis(20))
        .fork_daemon::<String>()
        .as_unit();
    assert!(rt.run(program, ()).is_done());
    assert!(eventually(&finished));
}

// ===========================================================================
// Racing and parallel composition
// ===========================================================================

#[test]
fn race_returns_the_first_success_and_interrupts_the_loser() {
    let rt = runtime();
    let interrupted = Ref::new(false);
    let slow = Io::<i32>::never().on_interrupt(interrupted.set(true));
    let fast = Io::succeed(1).delay(Duration::from_millis(50));
    assert_eq!(rt.run(fast.race(slow), ()), Exit::done(1));
    assert!(*interrupted.get_now());
}

#[test]
fn race_prefers_a_late_success_over_an_early_failure() {
    let rt = runtime();
    let failing = Io::<i32>::fail("early".into());
    let late = Io::succeed(2).delay(Duration::from_millis(10));
    assert_eq!(rt.run(failing.race(late), ()), Exit::done(2));
}

#[test]
fn race_keeps_both_failures() {
    let rt = runtime();
    let left = Io::<i32>::fail("a".into());
    let right = Io::<i32>::fail("b".into()).delay(Duration::from_millis(5));
    let exit = rt.run(left.race(right), ());
    let mut failures: Vec<String> = exit.cause().unwrap().failures().into_iter().cloned().collect();
    failures.sort();
    assert_eq!(failures, vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn zip_par_runs_both_sides_concurrently() {
    let rt = runtime();
    let left = Io::succeed(1).delay(Duration::from_millis(40));
    let right = Io::succeed("b").delay(Duration::from_millis(40));
    let start = Instant::now();
    assert_eq!(rt.run(left.zip_par(right), ()), Exit::done((1, "b")));
    assert!(start.elapsed() < Duration::from_millis(75));
}

#[test]
fn zip_par_failure_interrupts_the_sibling() {
    let rt = runtime();
    let interrupted = Ref::new(false);
    let failing = Io::<i32>::fail("x".into()).delay(Duration::from_millis(30));
    let blocked = Io::<i32>::never().on_interrupt(interrupted.set(true));
    assert_eq!(rt.run(failing.zip_par(blocked), ()), Exit::fail("x".to_string()));
    assert!(*interrupted.get_now());
}

#[test]
fn zip_par_keeps_a_sibling_failure_as_remaining() {
    let rt = runtime();
    let first = Io::<i32>::fail("first".into());
    let second = Io::<i32>::fail("second".into())
        .delay(Duration::from_millis(20))
        .uninterruptible();
    let exit = rt.run(first.zip_par(second), ());
    let halt = exit.as_halt().unwrap();
    assert_eq!(halt.cause, Cause::fail("first".to_string()));
    assert_eq!(halt.remaining, vec![Cause::fail("second".to_string())]);
}

#[test]
fn zip_par_reports_the_left_failure_first_when_both_fail() {
    let rt = runtime();
    let left = Io::<i32>::fail("left".into())
        .delay(Duration::from_millis(20))
        .uninterruptible();
    let right = Io::<i32>::fail("right".into());
    let exit = rt.run(left.zip_par(right), ());
    let halt = exit.as_halt().unwrap();
    assert_eq!(halt.cause, Cause::fail("left".to_string()));
    assert_eq!(halt.remaining, vec![Cause::fail("right".to_string())]);
}

#[test]
fn collect_all_par_preserves_input_order() {
    let rt = runtime();
    let effects = (0..6u64).map(|n| Io::succeed(n).delay(Duration::from_millis(30 - n * 5)));
    assert_eq!(
        rt.run(Io::collect_all_par(effects), ()),
        Exit::done(vec![0, 1, 2, 3, 4, 5])
    );
    assert_eq!(
        rt.run(Io::<i32>::collect_all_par(Vec::new()), ()),
        Exit::done(Vec::new())
    );
}

#[test]
fn collect_all_par_failure_interrupts_the_rest() {
    let rt = runtime();
    let interrupted = Ref::new(0);
    let mut effects = vec![Io::<i32>::fail("boom".into()).delay(Duration::from_millis(30))];
    for _ in 0..3 {
        effects.push(Io::never().on_interrupt(interrupted.update(|n| n + 1)));
    }
    assert_eq!(rt.run(Io::collect_all_par(effects), ()), Exit::fail("boom".to_string()));
    assert_eq!(*interrupted.get_now(), 3);
}

#[test]
fn for_each_par_maps_every_item() {
    let rt = runtime();
    let program = Io::for_each_par(1..=4, |n| Io::succeed(n * 10));
    assert_eq!(rt.run(program, ()), Exit::done(vec![10, 20, 30, 40]));
}

#[test]
fn interrupting_a_parallel_parent_interrupts_every_child() {
    let rt = runtime();
    let ready = Queue::unbounded();
    let interrupted = Ref::new(0);
    let children = (0..3).map(|_| {
        ready
            .offer(())
            .zip_right(Io::<()>::never())
            .on_interrupt(interrupted.update(|n| n + 1))
    });
    let parent = Io::collect_all_par(children.collect::<Vec<_>>());
    let waiting = ready.clone();
    let program = parent.fork::<String>().chain(move |fiber| {
        waiting
            .take()
            .repeat_n(2)
            .zip_right(fiber.interrupt::<(), String>())
    });
    assert!(rt.run(program, ()).into_result().unwrap().is_interrupted());
    assert_eq!(*interrupted.get_now(), 3);
}
