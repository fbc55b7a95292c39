//! Bounded retry with linear backoff

use crate::{
    config::ProcessingConstraints,
    error::{PipelineError, Result},
};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry policy for transient failures
///
/// Attempt `n` (1-based) that fails with a retryable error waits
/// `backoff * n` before attempt `n + 1`. At most `max_retries` retries follow
/// the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

/// Result of a retried operation with the number of attempts made
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self { max_retries, backoff }
    }

    /// Policy that never retries
    #[must_use]
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    #[must_use]
    pub fn from_constraints(constraints: &ProcessingConstraints) -> Self {
        Self::new(constraints.max_retries, constraints.retry_backoff())
    }

    /// Delay after failed attempt `attempt` (1-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }

    /// Total number of attempts allowed
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Run `operation` until it succeeds, fails permanently or retries run out
    ///
    /// The closure receives the 1-based attempt number. Cancellation is
    /// checked before every attempt and interrupts the backoff sleep.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(PipelineError::cancelled("cancelled before attempt")),
                    attempts: attempt - 1,
                };
            }

            let error = match operation(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    }
                },
                Err(error) => error,
            };

            if !error.is_retryable() || attempt >= self.max_attempts() {
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                };
            }

            let delay = self.delay_for(attempt);
            tracing::warn!(
                attempt,
                max_attempts = self.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying after transient failure"
            );

            tokio::select! {
                () = cancel.cancelled() => {
                    return RetryOutcome {
                        result: Err(PipelineError::cancelled("cancelled during retry backoff")),
                        attempts: attempt,
                    };
                },
                () = tokio::time::sleep(delay) => {},
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.max_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures_then_succeeds() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1000));
        let started = tokio::time::Instant::now();

        let outcome = policy
            .execute(&CancellationToken::new(), |attempt| async move {
                if attempt < 3 {
                    Err(PipelineError::inference("transient"))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), 3);
        assert_eq!(outcome.attempts, 3);
        // 1s after the first failure, 2s after the second
        assert!(started.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        let outcome = policy
            .execute(&CancellationToken::new(), |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(PipelineError::inference("still broken"))
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::InferenceFailed);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_returned_immediately() {
        let policy = RetryPolicy::new(5, Duration::from_secs(60));
        let outcome = policy
            .execute(&CancellationToken::new(), |_| async {
                Err::<(), _>(PipelineError::model("missing model file"))
            })
            .await;

        assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::ModelLoadFailed);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let outcome = policy
            .execute(&cancel, |_| async { Err::<(), _>(PipelineError::inference("flaky")) })
            .await;

        assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = RetryPolicy::none()
            .execute(&cancel, |_| async { Ok::<_, PipelineError>(()) })
            .await;
        assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(outcome.attempts, 0);
    }
}
