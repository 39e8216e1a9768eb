//! General-purpose resilience primitives used by the tracker, DHT and
//! checkpoint subsystems: retry with backoff, timeouts, a circuit
//! breaker, a token-bucket rate limiter, and a bounded bulk-operation
//! runner.
//!
//! Translated from `original_source/ccbt/resilience.py`'s decorator-based
//! primitives (`with_retry`, `with_timeout`, `CircuitBreaker`,
//! `RateLimiter`, `BulkOperationManager`) into plain async functions and
//! structs, since Rust has no decorator macros; the semantics (exponential
//! backoff, failure-count-triggered open state, half-open trial) are kept
//! as the Python original defines them.

use std::{
    future::Future,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

use tokio::{sync::Mutex, time::Instant};

/// Retries `f` up to `max_attempts` times (the first call plus
/// `max_attempts - 1` retries), doubling `initial_backoff` after each
/// failure. Returns the last error if every attempt fails.
pub(crate) async fn retry<F, Fut, T, E>(
    max_attempts: usize,
    initial_backoff: Duration,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = initial_backoff;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_attempts {
                    return Err(err);
                }
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }
}

/// Races `fut` against `duration`, yielding [`TimedOut`] if it elapses
/// first.
pub(crate) async fn with_timeout<Fut, T>(
    duration: Duration,
    fut: Fut,
) -> Result<T, TimedOut>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(duration, fut).await.map_err(|_| TimedOut)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation timed out")]
pub(crate) struct TimedOut;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Trips open after too many consecutive failures, short-circuiting
/// further calls until `reset_timeout` has passed, at which point a
/// single trial call is allowed through (half-open) to decide whether to
/// close again or re-open.
pub(crate) struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    state: Mutex<BreakerState>,
    failure_count: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CircuitBreakerError<E> {
    Open,
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "circuit breaker is open"),
            Self::Inner(err) => write!(f, "{err}"),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for CircuitBreakerError<E> {}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            state: Mutex::new(BreakerState::Closed),
            failure_count: AtomicU32::new(0),
            opened_at: Mutex::new(None),
        }
    }

    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        {
            let mut state = self.state.lock().await;
            if *state == BreakerState::Open {
                let opened_at = self.opened_at.lock().await;
                let elapsed = opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.reset_timeout {
                    *state = BreakerState::HalfOpen;
                } else {
                    return Err(CircuitBreakerError::Open);
                }
            }
        }

        match f().await {
            Ok(value) => {
                self.failure_count.store(0, Ordering::SeqCst);
                *self.state.lock().await = BreakerState::Closed;
                Ok(value)
            }
            Err(err) => {
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.failure_threshold {
                    *self.state.lock().await = BreakerState::Open;
                    *self.opened_at.lock().await = Some(Instant::now());
                }
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }
}

/// A simple token-bucket rate limiter: up to `burst` operations may
/// proceed immediately, after which callers wait for tokens to
/// replenish at `rate` per second.
pub(crate) struct RateLimiter {
    rate_per_sec: f64,
    burst: f64,
    tokens: Mutex<f64>,
    last_refill: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            rate_per_sec,
            burst,
            tokens: Mutex::new(burst),
            last_refill: Mutex::new(Instant::now()),
        }
    }

    /// Waits until a single token is available, then consumes it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut tokens = self.tokens.lock().await;
                let mut last_refill = self.last_refill.lock().await;
                let elapsed = last_refill.elapsed().as_secs_f64();
                *tokens = (*tokens + elapsed * self.rate_per_sec).min(self.burst);
                *last_refill = Instant::now();

                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - *tokens;
                    Some(Duration::from_secs_f64(deficit / self.rate_per_sec))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

/// Runs a batch of fallible futures with bounded concurrency, collecting
/// successes and failures separately rather than aborting the whole
/// batch on the first error (mirrors `BulkOperationManager`'s
/// best-effort semantics in the Python original).
pub(crate) struct BulkOperationManager {
    max_concurrency: usize,
}

impl BulkOperationManager {
    pub fn new(max_concurrency: usize) -> Self {
        Self { max_concurrency }
    }

    pub async fn run_all<T, E, Fut, I>(&self, ops: I) -> (Vec<T>, Vec<E>)
    where
        I: IntoIterator<Item = Fut>,
        Fut: Future<Output = Result<T, E>>,
    {
        use futures::stream::{self, StreamExt};

        let results: Vec<Result<T, E>> = stream::iter(ops)
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut oks = Vec::new();
        let mut errs = Vec::new();
        for result in results {
            match result {
                Ok(v) => oks.push(v),
                Err(e) => errs.push(e),
            }
        }
        (oks, errs)
    }
}

/// Total successes/failures observed by a [`BulkOperationManager`] run,
/// kept as a running counter for status reporting.
#[derive(Default)]
pub(crate) struct BulkOperationStats {
    successes: AtomicU64,
    failures: AtomicU64,
}

impl BulkOperationStats {
    pub fn record(&self, success: bool) {
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let attempts = AtomicUsize::new(0);
        let result: Result<u32, &str> = retry(5, Duration::from_millis(1), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("not yet")
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let result: Result<u32, &str> =
            retry(3, Duration::from_millis(1), || async { Err("nope") }).await;
        assert_eq!(result, Err("nope"));
    }

    #[tokio::test]
    async fn with_timeout_reports_slow_futures() {
        let result = with_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        let _ = breaker.call(|| async { Err::<(), &str>("x") }).await;
        let _ = breaker.call(|| async { Err::<(), &str>("x") }).await;
        let result = breaker.call(|| async { Ok::<(), &str>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open)));
    }

    #[tokio::test]
    async fn rate_limiter_allows_burst_then_throttles() {
        let limiter = RateLimiter::new(1000.0, 2.0);
        limiter.acquire().await;
        limiter.acquire().await;
        // third call within the same instant should still complete, just
        // after a short wait for replenishment
        limiter.acquire().await;
    }

    #[tokio::test]
    async fn bulk_operation_manager_separates_oks_and_errs() {
        let manager = BulkOperationManager::new(4);
        let ops = vec![
            async { Ok::<u32, &str>(1) },
            async { Err::<u32, &str>("bad") },
            async { Ok::<u32, &str>(3) },
        ];
        let (oks, errs) = manager.run_all(ops).await;
        assert_eq!(oks.len(), 2);
        assert_eq!(errs.len(), 1);
    }
}
