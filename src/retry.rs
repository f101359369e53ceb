//! Bounded exponential backoff around Create calls

use crate::CreateError;
use std::future::Future;
use std::time::Duration;

/// Retry policy for Create calls
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, first call included
    pub max_attempts: u32,
    /// Backoff base; the delay after attempt `n` is `unit * base^n`
    pub base: f64,
    /// Length of one backoff unit
    pub unit: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: 2.0,
            unit: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

/// Successful call together with the number of attempts it took
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attempted<T> {
    /// Call result
    pub value: T,
    /// Attempts made, 1-indexed
    pub attempts: u32,
}

/// Failed call together with the number of attempts made
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttemptFailure {
    /// Final error; `RetryExhausted` when the budget ran out
    pub error: CreateError,
    /// Attempts made, 1-indexed
    pub attempts: u32,
}

impl RetryPolicy {
    /// Delay before the retry that follows attempt `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.base.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.unit.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Run `op` until it succeeds, fails non-transiently, or the budget is spent.
    ///
    /// `op` receives the 1-indexed attempt number. Only transient errors are
    /// retried; conflicts and validation failures come back on the attempt
    /// that produced them.
    pub async fn execute<F, Fut, T>(&self, operation: &str, mut op: F) -> Result<Attempted<T>, AttemptFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CreateError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt: u32 = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation, attempt, "Succeeded after retries");
                    }
                    return Ok(Attempted { value, attempts: attempt });
                }
                Err(error) if !error.is_retriable() => {
                    return Err(AttemptFailure { error, attempts: attempt });
                }
                Err(error) if attempt >= max_attempts => {
                    tracing::warn!(operation, attempts = attempt, error = %error, "Max retries exceeded");
                    return Err(AttemptFailure {
                        error: CreateError::RetryExhausted {
                            attempts: attempt,
                            last: Box::new(error),
                        },
                        attempts: attempt,
                    });
                }
                Err(error) => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
