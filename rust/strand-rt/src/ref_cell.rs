//! `Ref<A>`: a shared mutable cell with atomic read-modify-write.
//!
//! Readers take a snapshot `Arc<A>`. Writers compute the next value from a
//! snapshot with no lock held and commit it only if the cell's version has
//! not moved in the meantime; otherwise they retry with a fresh snapshot.
//! Every committed update therefore sees exactly the value it replaces, and
//! writes form a total order.

use crate::effect::Effect;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

struct Cell<A> {
    version: u64,
    value: Arc<A>,
}

pub struct Ref<A> {
    cell: Arc<RwLock<Cell<A>>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<A: fmt::Debug> fmt::Debug for Ref<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = self.cell.read();
        f.debug_struct("Ref")
            .field("version", &cell.version)
            .field("value", &cell.value)
            .finish()
    }
}

impl<A> Ref<A>
where
    A: Send + Sync + 'static,
{
    /// A new cell holding `value`.
    pub fn new(value: A) -> Self {
        Self {
            cell: Arc::new(RwLock::new(Cell {
                version: 0,
                value: Arc::new(value),
            })),
        }
    }

    /// An effect allocating a fresh cell on every run.
    pub fn make<R, E>(value: A) -> Effect<R, E, Ref<A>>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
        A: Clone,
    {
        Effect::sync(move || Ref::new(value.clone()))
    }

    fn snapshot(&self) -> (u64, Arc<A>) {
        let cell = self.cell.read();
        (cell.version, Arc::clone(&cell.value))
    }

    // -- immediate operations ---------------------------------------------

    pub fn get_now(&self) -> Arc<A> {
        self.snapshot().1
    }

    pub fn set_now(&self, value: A) {
        let mut cell = self.cell.write();
        cell.version += 1;
        cell.value = Arc::new(value);
    }

    /// Atomically replace the value with `f(current).1`, returning
    /// `f(current).0`. `f` may run more than once under contention.
    pub fn modify_now<B>(&self, f: impl Fn(&A) -> (B, A)) -> B {
        loop {
            let (version, current) = self.snapshot();
            let (out, next) = f(&current);
            let mut cell = self.cell.write();
            if cell.version == version {
                cell.version += 1;
                cell.value = Arc::new(next);
                return out;
            }
            drop(cell);
            tracing::trace!(version, "ref update lost a race, retrying");
        }
    }

    /// Like [`Ref::modify_now`], but `f` may decline to change anything.
    pub fn modify_some_now<B>(&self, f: impl Fn(&A) -> Option<(B, A)>) -> Option<B> {
        loop {
            let (version, current) = self.snapshot();
            let (out, next) = f(&current)?;
            let mut cell = self.cell.write();
            if cell.version == version {
                cell.version += 1;
                cell.value = Arc::new(next);
                return Some(out);
            }
            drop(cell);
            tracing::trace!(version, "ref update lost a race, retrying");
        }
    }

    // -- effects ----------------------------------------------------------

    pub fn get<R, E>(&self) -> Effect<R, E, A>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
        A: Clone,
    {
        let this = self.clone();
        Effect::sync(move || A::clone(&this.get_now()))
    }

    pub fn set<R, E>(&self, value: A) -> Effect<R, E, ()>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
        A: Clone,
    {
        let this = self.clone();
        Effect::sync(move || this.set_now(value.clone()))
    }

    /// Atomically compute a result and a new value from the current one.
    pub fn modify<R, E, B>(&self, f: impl Fn(&A) -> (B, A) + Send + Sync + 'static) -> Effect<R, E, B>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
        B: Send + 'static,
    {
        let this = self.clone();
        Effect::sync(move || this.modify_now(&f))
    }

    pub fn update<R, E>(&self, f: impl Fn(&A) -> A + Send + Sync + 'static) -> Effect<R, E, ()>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
    {
        self.modify(move |a| ((), f(a)))
    }

    pub fn update_and_get<R, E>(&self, f: impl Fn(&A) -> A + Send + Sync + 'static) -> Effect<R, E, A>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
        A: Clone,
    {
        self.modify(move |a| {
            let next = f(a);
            (next.clone(), next)
        })
    }

    pub fn get_and_update<R, E>(&self, f: impl Fn(&A) -> A + Send + Sync + 'static) -> Effect<R, E, A>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
        A: Clone,
    {
        self.modify(move |a| (a.clone(), f(a)))
    }

    pub fn get_and_set<R, E>(&self, value: A) -> Effect<R, E, A>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
        A: Clone,
    {
        self.modify(move |a| (a.clone(), value.clone()))
    }

    /// Apply `f` when it returns `Some`; leave the cell alone otherwise.
    pub fn update_some<R, E>(&self, f: impl Fn(&A) -> Option<A> + Send + Sync + 'static) -> Effect<R, E, ()>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
    {
        let this = self.clone();
        Effect::sync(move || {
            this.modify_some_now(|a| f(a).map(|next| ((), next)));
        })
    }

    /// Like [`Ref::modify`], returning `default` when `f` declines.
    pub fn modify_some<R, E, B>(
        &self,
        default: B,
        f: impl Fn(&A) -> Option<(B, A)> + Send + Sync + 'static,
    ) -> Effect<R, E, B>
    where
        R: Send + Sync + 'static,
        E: Send + 'static,
        B: Clone + Send + Sync + 'static,
    {
        let this = self.clone();
        Effect::sync(move || this.modify_some_now(&f).unwrap_or_else(|| default.clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn modify_returns_output_and_stores_next() {
        let cell = Ref::new(10);
        let out = cell.modify_now(|n| (n * 2, n + 1));
        assert_eq!(out, 20);
        assert_eq!(*cell.get_now(), 11);
    }

    #[test]
    fn modify_some_declines_without_writing() {
        let cell = Ref::new(1);
        assert_eq!(cell.modify_some_now(|_| None::<((), i32)>), None);
        assert_eq!(*cell.get_now(), 1);
        assert_eq!(cell.modify_some_now(|n| Some((*n, n + 1))), Some(1));
        assert_eq!(*cell.get_now(), 2);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let cell = Ref::new(0u64);
        let calls = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        cell.modify_now(|n| {
                            calls.fetch_add(1, Ordering::Relaxed);
                            ((), n + 1)
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*cell.get_now(), 8_000);
        assert!(calls.load(Ordering::Relaxed) >= 8_000);
    }

    #[test]
    fn snapshots_are_stable() {
        let cell = Ref::new(String::from("a"));
        let before = cell.get_now();
        cell.set_now(String::from("b"));
        assert_eq!(*before, "a");
        assert_eq!(*cell.get_now(), "b");
    }
}
