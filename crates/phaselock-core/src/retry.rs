//! Bounded exponential backoff for collaborator calls.
//!
//! Attempt `n` (1-based) that fails with a retryable error waits
//! `min(base * 2^(n-1), max)` plus up to a quarter of that in random
//! jitter before attempt `n + 1`. Jitter is the only use of runtime
//! randomness in the crate and never touches lattice state.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::RetryConfig;

/// Attempt budget and delay bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy. At least one attempt is always made.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Create a policy from configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// A policy that makes one attempt and never sleeps.
    pub const fn once() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Total attempts allowed.
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff after failed attempt `attempt` (1-based), before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1_u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Backoff with up to 25% random jitter, never above `max_delay`.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        let spread = delay.checked_div(4).unwrap_or_default();
        if spread.is_zero() {
            return delay;
        }
        let spread_ms = u64::try_from(spread.as_millis()).unwrap_or(u64::MAX);
        let jitter = Duration::from_millis(rand::rng().random_range(0..=spread_ms));
        delay.saturating_add(jitter).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt budget is spent. Returns the last error on failure.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut call: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1_u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && is_retryable(&err) => {
                let delay = policy.jittered_delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(4, Duration::from_millis(100), Duration::from_millis(300))
    }

    #[test]
    fn delay_doubles_then_caps() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
        assert_eq!(policy.delay_for(40), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = policy();
        for attempt in 1..6 {
            let base = policy.delay_for(attempt);
            let jittered = policy.jittered_delay_for(attempt);
            assert!(jittered >= base);
            assert!(jittered <= Duration::from_millis(300));
        }
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(&policy(), "test", |_| true, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 { Err(format!("fail {n}")) } else { Ok(n) }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(&policy(), "test", |_| true, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down".to_owned())
        })
        .await;
        assert_eq!(result.unwrap_err(), "down");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> =
            retry_with_backoff(&policy(), "test", |e: &String| e != "fatal", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("fatal".to_owned())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
