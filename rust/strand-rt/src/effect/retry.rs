//! Retrying failed effects.
//!
//! The combinators re-run the whole description after a typed failure.
//! Each retry goes through [`Effect::suspend`], so the number of attempts is
//! bounded only by the caller, never by the host stack. Defects and
//! interruptions are never retried.

use super::Effect;
use std::sync::Arc;
use std::time::Duration;
use strand_core::Halt;

// ---------------------------------------------------------------------------
// Backoff strategy
// ---------------------------------------------------------------------------

/// Strategy for computing the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Same delay every time.
    Constant,
    /// `base * (attempt + 1)`.
    Linear,
    /// `base * 2^attempt`.
    Exponential,
    /// `base * fib(attempt)`.
    Fibonacci,
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// How often and how patiently to retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries).
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on the computed delay (before jitter).
    pub max_delay_ms: u64,
    pub backoff: BackoffStrategy,
    /// Spread delays by ±25 %, deterministically per attempt.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff: BackoffStrategy::Exponential,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Retry up to `max_retries` times with a fixed delay.
    pub fn constant(max_retries: u32, delay: Duration) -> Self {
        let ms = delay.as_millis().min(u64::MAX as u128) as u64;
        Self {
            max_retries,
            base_delay_ms: ms,
            max_delay_ms: ms,
            backoff: BackoffStrategy::Constant,
            jitter: false,
        }
    }

    /// Retry up to `max_retries` times, doubling the delay each time.
    pub fn exponential(max_retries: u32, base: Duration) -> Self {
        Self {
            max_retries,
            base_delay_ms: base.as_millis().min(u64::MAX as u128) as u64,
            ..Self::default()
        }
    }

    /// Raw backoff for a 0-based retry number, before clamping and jitter.
    pub fn compute_backoff(&self, attempt: u32) -> u64 {
        let base = self.base_delay_ms;
        match self.backoff {
            BackoffStrategy::Constant => base,
            BackoffStrategy::Linear => base.saturating_mul(attempt.saturating_add(1) as u64),
            BackoffStrategy::Exponential => {
                base.saturating_mul(1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX))
            }
            BackoffStrategy::Fibonacci => base.saturating_mul(fibonacci(attempt)),
        }
    }

    /// Deterministic ±25 % jitter derived from `seed`.
    pub fn apply_jitter(&self, delay_ms: u64, seed: u64) -> u64 {
        let quarter = delay_ms / 4;
        if quarter == 0 {
            return delay_ms;
        }
        let hash = seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let offset = hash % quarter.saturating_mul(2).saturating_add(1);
        delay_ms.saturating_add(offset).saturating_sub(quarter)
    }

    /// The delay before retry number `attempt` (0-based), or `None` once
    /// retries are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let clamped = self.compute_backoff(attempt).min(self.max_delay_ms);
        let ms = if self.jitter {
            self.apply_jitter(clamped, attempt as u64)
        } else {
            clamped
        };
        Some(Duration::from_millis(ms))
    }
}

/// `n`-th Fibonacci number, 0-indexed with fib(0) = fib(1) = 1.
fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

// ---------------------------------------------------------------------------
// Combinators
// ---------------------------------------------------------------------------

type Predicate<R, E> = Arc<dyn Fn(&E) -> Effect<R, E, bool> + Send + Sync>;

impl<R, E, A> Effect<R, E, A>
where
    R: Send + Sync + 'static,
    E: Send + 'static,
    A: Send + 'static,
{
    /// On a typed failure `e`, run `predicate(&e)`: `true` retries the
    /// whole effect, `false` fails with `e`. A failing predicate fails the
    /// effect with the predicate's error.
    pub fn retry_while_m(self, predicate: impl Fn(&E) -> Effect<R, E, bool> + Send + Sync + 'static) -> Self {
        self.retry_loop(Arc::new(predicate))
    }

    fn retry_loop(self, predicate: Predicate<R, E>) -> Self {
        let again = self.clone();
        self.catch_all_cause(move |halt: Halt<E>| {
            let decision = match halt.cause.first_failure() {
                Some(error) => predicate(error),
                None => return Effect::halt_once(halt),
            };
            let again = again.clone();
            let predicate = Arc::clone(&predicate);
            decision.chain_once(move |retry| {
                if retry {
                    Effect::suspend(move || again.clone().retry_loop(Arc::clone(&predicate)))
                } else {
                    Effect::halt_once(halt)
                }
            })
        })
    }

    pub fn retry_while(self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.retry_while_m(move |e| Effect::now(predicate(e)))
    }

    pub fn retry_until(self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.retry_while(move |e| !predicate(e))
    }

    /// Retry at most `n` times after the first attempt.
    pub fn retry_n(self, n: usize) -> Self {
        if n == 0 {
            return self;
        }
        let again = self.clone();
        self.catch_all_cause(move |halt: Halt<E>| {
            if halt.cause.first_failure().is_none() {
                return Effect::halt_once(halt);
            }
            let again = again.clone();
            Effect::suspend(move || again.clone().retry_n(n - 1))
        })
    }

    /// Retry typed failures accepted by `should_retry`, sleeping between
    /// attempts as `policy` prescribes.
    pub fn retry_policy(
        self,
        policy: RetryPolicy,
        should_retry: impl Fn(&E) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_attempt(Arc::new(policy), Arc::new(should_retry), 0)
    }

    fn retry_attempt(
        self,
        policy: Arc<RetryPolicy>,
        should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
        attempt: u32,
    ) -> Self {
        let again = self.clone();
        self.catch_all_cause(move |halt: Halt<E>| {
            let retryable = halt.cause.first_failure().is_some_and(|e| should_retry(e));
            let delay = match policy.delay_for(attempt) {
                Some(delay) if retryable => delay,
                _ => return Effect::halt_once(halt),
            };
            tracing::trace!(attempt, delay_ms = delay.as_millis() as u64, "retrying after failure");
            let again = again.clone();
            let policy = Arc::clone(&policy);
            let should_retry = Arc::clone(&should_retry);
            Effect::<R, E, ()>::sleep(delay).zip_right(Effect::suspend(move || {
                again
                    .clone()
                    .retry_attempt(Arc::clone(&policy), Arc::clone(&should_retry), attempt + 1)
            }))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
