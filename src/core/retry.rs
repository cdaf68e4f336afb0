//! Exponential backoff retry wrapper for transient failures.
//!
//! The delay for attempt n (0-indexed) is `min(initial * factor^n, max)`,
//! optionally scaled by a uniform random factor in [0.5, 1.0] so concurrent
//! steps do not retry in lockstep. Errors the caller's predicate marks as
//! non-retryable propagate immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::cancel::CancelToken;

/// Retry policy: attempt count, backoff curve, and jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first (never zero)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_max_delay() -> u64 {
    30_000
}
fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::generation()
    }
}

impl RetryPolicy {
    /// Policy for generation-backend calls: 3 attempts, 1s, x2, cap 30s.
    pub fn generation() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }

    /// Policy for local file operations: 5 attempts, 100ms, x1.5, cap 2s.
    pub fn file_ops() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            backoff_factor: 1.5,
            max_delay_ms: 2000,
            jitter: true,
        }
    }

    /// Policy for network calls: 5 attempts, 500ms, x2, cap 10s.
    pub fn network() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }

    /// Backoff delay before retrying after attempt `attempt` (0-indexed),
    /// without jitter applied.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f64 * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Backoff delay with jitter applied when enabled.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let scale: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        base.mul_f64(scale)
    }
}

/// Outcome of a retried operation that never succeeded.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The predicate marked the error non-retryable; it is returned as-is.
    #[error("{0}")]
    NotRetryable(E),

    /// Every attempt failed with a retryable error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// The cancellation token fired between attempts.
    #[error("cancelled while retrying")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The underlying error, when one exists.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::NotRetryable(e) | Self::Exhausted { last: e, .. } => Some(e),
            Self::Cancelled => None,
        }
    }
}

/// Run `op` until it succeeds, the policy is exhausted, the predicate says
/// the error is not worth retrying, or `cancel` fires between attempts.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    cancel: Option<&CancelToken>,
    is_retryable: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);

    for attempt in 0..attempts {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) => return Err(RetryError::NotRetryable(e)),
            Err(e) => {
                if attempt + 1 >= attempts {
                    return Err(RetryError::Exhausted {
                        attempts,
                        last: e,
                    });
                }

                let delay = policy.delay(attempt);
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    // max_attempts >= 1, so the loop always returns before falling through.
    Err(RetryError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 1,
            backoff_factor: 2.0,
            max_delay_ms: 4,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_curve() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 1000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            jitter: false,
        };

        assert_eq!(policy.base_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.base_delay(2), Duration::from_millis(4000));
        // Capped at max_delay.
        assert_eq!(policy.base_delay(10), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter: true,
            ..fast_policy(3)
        };
        let base = policy.base_delay(1);
        for _ in 0..50 {
            let jittered = policy.delay(1);
            assert!(jittered <= base);
            assert!(jittered >= base.mul_f64(0.5));
        }
    }

    #[test]
    fn test_preconfigured_policies() {
        let generation = RetryPolicy::generation();
        assert_eq!(generation.max_attempts, 3);
        assert_eq!(generation.initial_delay_ms, 1000);
        assert_eq!(generation.max_delay_ms, 30_000);

        let file_ops = RetryPolicy::file_ops();
        assert_eq!(file_ops.max_attempts, 5);
        assert_eq!(file_ops.initial_delay_ms, 100);
        assert_eq!(file_ops.max_delay_ms, 2000);

        let network = RetryPolicy::network();
        assert_eq!(network.max_attempts, 5);
        assert_eq!(network.initial_delay_ms, 500);
        assert_eq!(network.max_delay_ms, 10_000);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast_policy(3), None, |_| true, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err("transient")
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&fast_policy(3), None, |_| true, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("still broken")
        })
        .await;

        match result.unwrap_err() {
            RetryError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "still broken");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_propagates_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&fast_policy(5), None, |_| false, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("validation failed")
        })
        .await;

        assert!(matches!(result.unwrap_err(), RetryError::NotRetryable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retrying() {
        let token = CancelToken::new();
        token.cancel();

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&fast_policy(5), Some(&token), |_| true, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("transient")
        })
        .await;

        assert!(matches!(result.unwrap_err(), RetryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
