//! Retry pattern with exponential backoff.
//!
//! A [`RetryPolicy`] is an immutable value describing how many times to run an
//! operation, how long to wait in between, and which [`FailureKind`]s are worth
//! another attempt. It carries no per-call state and can be shared freely.
//!
//! ## Example
//!
//! ```rust
//! use bulwark_core::{with_retry, RetryPolicy, ResilienceError};
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let policy = RetryPolicy::new(3).base_backoff(Duration::from_millis(1));
//! let calls = AtomicU32::new(0);
//!
//! let result = with_retry(
//!     || async {
//!         if calls.fetch_add(1, Ordering::SeqCst) == 0 {
//!             Err("connection reset")
//!         } else {
//!             Ok("delivered")
//!         }
//!     },
//!     &policy,
//! )
//! .await;
//!
//! assert_eq!(result.unwrap(), "delivered");
//! assert_eq!(calls.load(Ordering::SeqCst), 2);
//! # });
//! ```

use crate::error::{ResilienceError, Result};
use crate::failure::{capture, panic_message, Failure, FailureKind};
use rand::Rng;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Hook invoked before each backoff sleep with `(attempt, error, wait)`.
pub type RetryHook = Arc<dyn Fn(u32, &Failure, Duration) + Send + Sync>;

/// Upper bound of the jitter added to a backoff, as a fraction of it.
const MAX_JITTER: f64 = 0.1;

/// Retry configuration.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial).
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub base_backoff: Duration,
    /// Ceiling for any single wait.
    pub max_backoff: Duration,
    /// Growth factor applied per attempt.
    pub backoff_multiplier: f64,
    /// Add up to 10% random jitter to each wait.
    pub jitter: bool,
    /// Failure kinds that are retried. Anything else fails immediately.
    pub retry_on: HashSet<FailureKind>,
    /// Overall budget for attempts plus waits.
    pub deadline: Option<Duration>,
    /// Called before every backoff sleep.
    pub on_retry: Option<RetryHook>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
            retry_on: HashSet::from([FailureKind::ErrorResult, FailureKind::Timeout]),
            deadline: None,
            on_retry: None,
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_backoff", &self.base_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .field("retry_on", &self.retry_on)
            .field("deadline", &self.deadline)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Create a new policy with the given attempt limit.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Set the initial backoff.
    pub fn base_backoff(mut self, backoff: Duration) -> Self {
        self.base_backoff = backoff;
        self
    }

    /// Set the maximum backoff.
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set the backoff multiplier. Values below 1.0 are treated as 1.0.
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the set of retryable failure kinds.
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    /// Bound the whole retry loop.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the retry hook.
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(u32, &Failure, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Whether a failure of this kind is retried.
    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        self.retry_on.contains(&kind)
    }

    /// Backoff after the given failed attempt (1-indexed), without jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let multiplier = self.backoff_multiplier.max(1.0);
        let nanos = self.base_backoff.as_nanos() as f64 * multiplier.powi(exponent);

        if !nanos.is_finite() || nanos >= self.max_backoff.as_nanos() as f64 {
            self.max_backoff
        } else {
            Duration::from_nanos(nanos.max(0.0).round() as u64)
        }
    }

    /// Backoff after the given failed attempt, with jitter applied if enabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let wait = self.backoff_for(attempt);
        if !self.jitter || wait.is_zero() {
            return wait;
        }

        let factor: f64 = rand::rng().random_range(0.0..=MAX_JITTER);
        wait.saturating_add(wait.mul_f64(factor)).min(self.max_backoff)
    }

    fn notify(&self, attempt: u32, failure: &Failure, wait: Duration) {
        let Some(hook) = &self.on_retry else {
            return;
        };

        if let Err(payload) =
            std::panic::catch_unwind(AssertUnwindSafe(|| hook(attempt, failure, wait)))
        {
            error!(
                attempt,
                panic = %panic_message(payload.as_ref()),
                "Retry hook panicked"
            );
        }
    }
}

/// Run `operation` under `policy`.
///
/// Returns the first success, [`ResilienceError::NonRetryable`] as soon as a
/// failure kind outside `retry_on` is seen, [`ResilienceError::Timeout`] if
/// the next wait would overrun the policy deadline, and
/// [`ResilienceError::MaxAttemptsReached`] once attempts run out.
pub async fn with_retry<F, Fut, T, E>(mut operation: F, policy: &RetryPolicy) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<Failure>,
{
    let max_attempts = policy.max_attempts.max(1);
    let started = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;

        let failure = match capture(operation()).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Retry succeeded");
                }
                return Ok(value);
            }
            Err(failure) => failure,
        };

        if !policy.is_retryable(failure.kind) {
            debug!(attempt, kind = %failure.kind, "Failure is not retryable");
            return Err(ResilienceError::NonRetryable {
                kind: failure.kind,
                detail: failure.detail,
            });
        }

        if attempt >= max_attempts {
            warn!(
                attempt,
                max_attempts,
                error = %failure,
                "Final retry attempt failed"
            );
            return Err(ResilienceError::MaxAttemptsReached {
                attempts: attempt,
                last_error: failure,
            });
        }

        let wait = policy.delay_for_attempt(attempt);

        if let Some(deadline) = policy.deadline
            && started.elapsed().saturating_add(wait) > deadline
        {
            warn!(
                attempt,
                deadline = ?deadline,
                error = %failure,
                "Retry deadline reached"
            );
            return Err(ResilienceError::Timeout { after: deadline });
        }

        debug!(
            attempt,
            delay = ?wait,
            error = %failure,
            "Retry attempt failed, waiting before retry"
        );
        policy.notify(attempt, &failure, wait);

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// A retry policy bound once and reused for many operations.
#[derive(Debug, Clone)]
pub struct RetryFn {
    policy: Arc<RetryPolicy>,
}

impl RetryFn {
    /// The bound policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` under the bound policy.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<Failure>,
    {
        with_retry(operation, &self.policy).await
    }
}

/// Bind `policy` so call sites only supply the operation.
pub fn create_retry_fn(policy: RetryPolicy) -> RetryFn {
    RetryFn {
        policy: Arc::new(policy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts)
            .base_backoff(Duration::from_millis(1))
            .max_backoff(Duration::from_millis(5))
            .jitter(false)
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_first_try() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(42)
            },
            &fast(3),
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_always_failing_runs_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down")
            },
            &fast(4),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(ResilienceError::MaxAttemptsReached {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last_error.detail, "down");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fail_k_times_then_succeed() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < 2 {
                        Err("flaky")
                    } else {
                        Ok(call)
                    }
                }
            },
            &fast(5),
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_kind_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                if true {
                    panic!("bug");
                }
                Ok::<_, Failure>(())
            },
            &fast(5),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result,
            Err(ResilienceError::NonRetryable {
                kind: FailureKind::Panic,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_retry_on_panic_when_configured() {
        let calls = AtomicU32::new(0);
        let policy = fast(2).retry_on([FailureKind::Panic]);

        let result: Result<()> = with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                if true {
                    panic!("bug");
                }
                Ok::<_, Failure>(())
            },
            &policy,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(result, Err(ResilienceError::MaxAttemptsReached { .. })));
    }

    #[test]
    fn test_backoff_is_non_decreasing_and_capped() {
        let policy = RetryPolicy::new(10)
            .base_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_secs(1));

        let mut previous = Duration::ZERO;
        for attempt in 1..=10 {
            let wait = policy.backoff_for(attempt);
            assert!(wait >= previous);
            assert!(wait <= Duration::from_secs(1));
            previous = wait;
        }

        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(5)
            .base_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_secs(10));

        for _ in 0..100 {
            let wait = policy.delay_for_attempt(2);
            assert!(wait >= Duration::from_millis(200));
            assert!(wait <= Duration::from_millis(220));
        }

        let capped = policy.clone().max_backoff(Duration::from_millis(200));
        for _ in 0..100 {
            assert!(capped.delay_for_attempt(5) <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(u32::MAX), policy.max_backoff);
    }

    #[test]
    fn test_backoff_never_shrinks_with_small_multiplier() {
        let policy = RetryPolicy::new(5)
            .base_backoff(Duration::from_millis(100))
            .backoff_multiplier(0.5);

        for attempt in 1..=5 {
            assert_eq!(policy.backoff_for(attempt), Duration::from_millis(100));
        }

        let nan = policy.clone().backoff_multiplier(f64::NAN);
        assert_eq!(nan.backoff_for(3), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_on_unbounded_backoff_saturates() {
        let policy = RetryPolicy::new(3)
            .base_backoff(Duration::MAX)
            .max_backoff(Duration::MAX);

        for _ in 0..20 {
            assert_eq!(policy.delay_for_attempt(1), Duration::MAX);
        }
    }

    #[tokio::test]
    async fn test_deadline_with_unbounded_backoff() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3)
            .base_backoff(Duration::MAX)
            .max_backoff(Duration::MAX)
            .jitter(false)
            .deadline(Duration::from_millis(10));

        let result: Result<()> = with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down")
            },
            &policy,
        )
        .await;

        assert!(matches!(result, Err(ResilienceError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_on_retry_hook_sees_each_wait() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let policy = fast(3).on_retry(move |attempt, failure, wait| {
            recorder.lock().push((attempt, failure.kind, wait));
        });

        let _ = with_retry(|| async { Err::<(), _>("nope") }, &policy).await;

        let seen = seen.lock().clone();
        assert_eq!(
            seen,
            vec![
                (1, FailureKind::ErrorResult, Duration::from_millis(1)),
                (2, FailureKind::ErrorResult, Duration::from_millis(2)),
            ]
        );
    }

    #[tokio::test]
    async fn test_panicking_hook_is_ignored() {
        let calls = AtomicU32::new(0);
        let policy = fast(3).on_retry(|_, _, _| panic!("hook"));

        let result = with_retry(
            || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move { if call == 0 { Err("first") } else { Ok(()) } }
            },
            &policy,
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_deadline_stops_the_loop() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(10)
            .base_backoff(Duration::from_millis(50))
            .jitter(false)
            .deadline(Duration::from_millis(120));

        let result: Result<()> = with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down")
            },
            &policy,
        )
        .await;

        assert!(matches!(result, Err(ResilienceError::Timeout { .. })));
        // Waits of 50ms then 100ms: the second would overrun 120ms.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_fn_is_reusable() {
        let retry = create_retry_fn(fast(2));

        let first = retry.call(|| async { Ok::<_, String>("a") }).await;
        let second: Result<()> = retry.call(|| async { Err("b") }).await;

        assert_eq!(first.unwrap(), "a");
        assert!(matches!(
            second,
            Err(ResilienceError::MaxAttemptsReached { attempts: 2, .. })
        ));
        assert_eq!(retry.policy().max_attempts, 2);
    }
}
