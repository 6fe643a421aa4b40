//! Integration tests for `Queue`: ordering, backpressure, shutdown and
//! interrupted waiters.

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::time::Duration;
use strand_rt::prelude::*;
use strand_rt::QueueError;

type Io<A> = Effect<(), String, A>;

fn runtime() -> Runtime {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Runtime::new(RuntimeConfig {
        worker_threads: 2,
        ..RuntimeConfig::default()
    })
    .unwrap()
}

fn pause() -> Io<()> {
    Io::sleep(Duration::from_millis(20))
}

// ===========================================================================
// Ordering and backpressure
// ===========================================================================

#[test]
fn elements_come_out_in_offer_order() {
    let rt = runtime();
    let queue = Queue::unbounded();
    let program = Io::for_each(1..=3, |n| queue.offer(n)).zip_right(queue.take_all());
    assert_eq!(rt.run(program, ()), Exit::done(vec![1, 2, 3]));
}

#[test]
fn take_waits_for_an_offer() {
    let rt = runtime();
    let queue = Queue::bounded(1).unwrap();
    let producer = queue.clone();
    let program = queue
        .take::<(), String>()
        .fork::<String>()
        .chain(move |taker| pause().zip_right(producer.offer(9)).zip_right(taker.join()));
    assert_eq!(rt.run(program, ()), Exit::done(9));
}

#[test]
fn full_queue_suspends_offerers_in_order() {
    let rt = runtime();
    let queue = Queue::bounded(2).unwrap();
    let producer = queue.clone();
    let consumer = queue.clone();
    let program = Io::for_each(0..5, move |n| producer.offer(n))
        .fork::<String>()
        .chain(move |fiber| {
            let consumer = consumer.clone();
            pause()
                .zip_right(consumer.size())
                .zip(Io::for_each(0..5, move |_| consumer.take()))
                .zip_left(fiber.join())
        });
    // Two buffered plus the offerer blocked on the third element.
    assert_eq!(rt.run(program, ()), Exit::done((3, vec![0, 1, 2, 3, 4])));
}

#[test]
fn producer_and_consumer_move_many_elements() {
    let rt = runtime();
    let queue = Queue::bounded(4).unwrap();
    let producer = Io::for_each(0..1_000u32, |n| queue.offer(n));
    let consumer = Io::for_each(0..1_000, |_| queue.take());
    let (_, received) = rt.run(producer.zip_par(consumer), ()).into_result().unwrap();
    assert_eq!(received, (0..1_000).collect::<Vec<_>>());
}

#[test]
fn poll_take_up_to_and_size() {
    let rt = runtime();
    let queue = Queue::unbounded();
    let empty = queue.poll::<(), String>();
    assert_eq!(rt.run(empty, ()), Exit::done(None));

    let program = Io::for_each(["a", "b", "c"], |s| queue.offer(s))
        .zip_right(queue.take_up_to(2))
        .zip(queue.size())
        .zip(queue.poll());
    assert_eq!(
        rt.run(program, ()),
        Exit::done(((vec!["a", "b"], 1), Some("c")))
    );
}

// ===========================================================================
// Interrupted waiters
// ===========================================================================

#[test]
fn an_interrupted_taker_does_not_consume_elements() {
    let rt = runtime();
    let queue = Queue::unbounded();
    let waiting = queue.clone();
    let program = queue
        .take::<(), String>()
        .fork::<String>()
        .chain(move |taker| {
            pause()
                .zip_right(taker.interrupt::<(), String>())
                .zip_right(waiting.offer(5))
                .zip_right(waiting.take())
        });
    assert_eq!(rt.run(program, ()), Exit::done(5));
}

#[test]
fn an_interrupted_offerer_does_not_deliver_its_element() {
    let rt = runtime();
    let queue = Queue::bounded(1).unwrap();
    let blocked = queue.clone();
    let program = queue
        .offer::<(), String>(1)
        .zip_right(blocked.offer::<(), String>(2).fork::<String>())
        .chain(move |offerer| {
            let queue = queue.clone();
            pause()
                .zip_right(offerer.interrupt::<(), String>())
                .zip_right(queue.take_all())
        });
    assert_eq!(rt.run(program, ()), Exit::done(vec![1]));
}

// ===========================================================================
// Shutdown
// ===========================================================================

#[test]
fn shutdown_interrupts_blocked_and_later_operations() {
    let rt = runtime();
    let queue = Queue::<i32>::unbounded();
    let control = queue.clone();
    let program = queue
        .take::<(), String>()
        .fork::<String>()
        .chain(move |taker| {
            let control = control.clone();
            pause()
                .zip_right(control.shutdown())
                .zip_right(taker.await_exit())
                .zip(control.offer::<(), String>(1).result::<String>())
                .zip(control.is_shutdown())
                .zip(Effect::fiber_id())
        });
    let (((blocked, later), shut), me) = rt.run(program, ()).into_result().unwrap();
    assert!(blocked.is_interrupted());
    assert!(blocked.cause().unwrap().interruptors().contains(&me));
    assert!(later.is_interrupted());
    assert!(shut);
}

#[test]
fn shutdown_is_idempotent_and_wakes_waiters() {
    let rt = runtime();
    let queue = Queue::<i32>::bounded(3).unwrap();
    let control = queue.clone();
    let program = queue
        .await_shutdown::<(), String>()
        .fork::<String>()
        .chain(move |waiter| {
            pause()
                .zip_right(control.shutdown())
                .zip_right(control.shutdown())
                .zip_right(waiter.join())
        });
    assert_eq!(rt.run(program, ()), Exit::done(()));
}

#[test]
fn zero_capacity_is_rejected() {
    assert_eq!(Queue::<u8>::bounded(0).unwrap_err(), QueueError::ZeroCapacity);
    assert_eq!(Queue::<u8>::bounded(2).unwrap().capacity(), Some(2));
    assert_eq!(Queue::<u8>::unbounded().capacity(), None);
}

// ===========================================================================
// Properties
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn any_capacity_delivers_every_element_in_order(
        capacity in 1usize..8,
        items in proptest::collection::vec(any::<i32>(), 0..64),
    ) {
        let rt = runtime();
        let queue = Queue::bounded(capacity).unwrap();
        let count = items.len();
        let producer = Io::for_each(items.clone(), |n| queue.offer(n));
        let consumer = Io::for_each(0..count, |_| queue.take());
        let exit = rt.run(producer.zip_par(consumer), ());
        prop_assert_eq!(exit, Exit::done((vec![(); count], items)));
    }
}
