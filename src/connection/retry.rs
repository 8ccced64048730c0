//! Bounded retry with exponential backoff
//!
//! Only transient failures ([`Error::is_transient`]) are retried. Configuration
//! and authentication failures return immediately. Cancellation is checked
//! before every attempt and during every backoff sleep, and surfaces as
//! [`Error::Cancelled`] rather than a timeout.

use crate::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Retry policy for connection attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Ceiling for a single backoff delay
    pub max_delay: Duration,
    /// Growth factor between delays
    pub multiplier: f64,
    /// Random spread applied to each delay (0.0 = none, 0.2 = ±20%)
    pub jitter: f64,
    /// Total time budget across all attempts
    pub budget: Duration,
    /// Bound on a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
            budget: Duration::from_secs(crate::config::DEFAULT_CONNECT_RETRY_TIMEOUT_SEC),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Default policy with the given total budget
    pub fn with_budget(budget: Duration) -> Self {
        Self {
            budget,
            ..Self::default()
        }
    }

    /// Backoff delay after `attempt` failed attempts, before jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1).min(32) as i32);
        let secs = (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = self.jitter.min(1.0);
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        Duration::from_secs_f64(delay.as_secs_f64() * factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails fatally, the budget runs out, or `cancel` fires.
///
/// `op` receives the 1-based attempt number. The first attempt always gets the
/// full per-attempt timeout, even with a zero budget.
pub async fn retry_async<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled(format!(
                "{} connection cancelled before attempt {}",
                label, attempt
            )));
        }

        let remaining = policy.budget.saturating_sub(started.elapsed());
        let attempt_timeout = if attempt == 1 {
            policy.attempt_timeout
        } else {
            policy.attempt_timeout.min(remaining.max(Duration::from_millis(1)))
        };

        crate::metrics::counters::connect_attempt(label);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled(format!(
                    "{} connection cancelled during attempt {}",
                    label, attempt
                )));
            }
            r = tokio::time::timeout(attempt_timeout, op(attempt)) => r,
        };

        let err = match outcome {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    tracing::info!(label, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(e)) if e.is_fatal() => {
                tracing::debug!(label, attempt, kind = %e.kind(), "fatal error, not retrying");
                return Err(e);
            }
            Ok(Err(e)) => e,
            Err(_) => Error::Connection(format!("attempt timed out after {:?}", attempt_timeout)),
        };

        let elapsed = started.elapsed();
        let remaining = policy.budget.saturating_sub(elapsed);
        let delay = policy.jittered(policy.backoff(attempt)).min(remaining);

        if remaining.is_zero() || delay.is_zero() {
            return Err(Error::Connection(format!(
                "{} connection failed after {} attempt(s) in {:.1}s: {}",
                label,
                attempt,
                elapsed.as_secs_f64(),
                err
            )));
        }

        tracing::warn!(
            label,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, retrying"
        );
        crate::metrics::counters::connect_retry(label);

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled(format!(
                    "{} connection cancelled while waiting to retry (after {} attempt(s))",
                    label, attempt
                )));
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(budget: Duration) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            jitter: 0.0,
            budget,
            attempt_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_backoff_grows_to_ceiling() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_secs(1));
        assert_eq!(policy.backoff(20), Duration::from_secs(10));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.jittered(Duration::from_secs(1));
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn test_default_budget_is_five_minutes() {
        assert_eq!(RetryPolicy::default().budget, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = retry_async(
            &fast_policy(Duration::from_secs(5)),
            &CancellationToken::new(),
            "test",
            move |attempt| {
                c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(Error::connection("refused"))
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = retry_async(
            &fast_policy(Duration::from_secs(5)),
            &CancellationToken::new(),
            "test",
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::auth("access denied")) }
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_reports_connection_error() {
        let err = retry_async(
            &fast_policy(Duration::from_millis(50)),
            &CancellationToken::new(),
            "test",
            |_| async { Err::<(), _>(Error::connection("refused")) },
        )
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("attempt(s)"));
    }

    #[tokio::test]
    async fn test_zero_budget_makes_one_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let _ = retry_async(
            &fast_policy(Duration::ZERO),
            &CancellationToken::new(),
            "test",
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::connection("refused")) }
            },
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_mid_retry() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            jitter: 0.0,
            ..fast_policy(Duration::from_secs(60))
        };

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = retry_async(&policy, &cancel, "test", |_| async {
            Err::<(), _>(Error::connection("refused"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_slow_attempt_times_out_and_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let policy = RetryPolicy {
            attempt_timeout: Duration::from_millis(20),
            ..fast_policy(Duration::from_secs(5))
        };
        let result = retry_async(&policy, &CancellationToken::new(), "test", move |attempt| {
            c.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 1 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }
}
