// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry policy with backoff.
//!
//! Only transient failures (network, timeout, 5xx, rate limit) are
//! retried; validation and auth failures surface immediately.

use crate::error::{FlowError, Result};
use crate::model::{BackoffStrategy, StepErrorPolicy};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts (1 = no retry).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Delay multiplier per attempt (2.0 = exponential, 1.0 = linear).
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a retry policy.
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    /// Builds a policy from a step's `on_error:` block.
    pub fn from_step_policy(policy: &StepErrorPolicy) -> Self {
        let multiplier = match policy.backoff {
            BackoffStrategy::Exponential => 2.0,
            BackoffStrategy::Linear => 1.0,
        };
        Self::new(
            policy.retry + 1,
            Duration::from_millis(500),
            multiplier,
            Duration::from_secs(30),
        )
    }

    /// Delay before retry number `attempt` (1-based), with up to 10%
    /// jitter.
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = match self.multiplier {
            m if m > 1.0 => {
                self.initial_delay.as_millis() as f64 * m.powi(attempt as i32 - 1)
            }
            _ => self.initial_delay.as_millis() as f64 * attempt as f64,
        };
        let capped = base.min(self.max_delay.as_millis() as f64);
        let jitter = rand::thread_rng().gen_range(0.0..0.1);
        Duration::from_millis((capped * (1.0 + jitter)) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, Duration::from_millis(500), 2.0, Duration::from_secs(30))
    }
}

/// Executes an operation under a retry policy.
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Creates a retry executor.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Runs `operation` up to `max_attempts` times, sleeping between
    /// attempts. Permanent errors are returned without further attempts.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if attempt > 1 {
                        debug!(attempt, "Giving up after retries");
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> FlowError {
        FlowError::from_provider("mock", ProviderError::Timeout)
    }

    fn permanent() -> FlowError {
        FlowError::from_provider("mock", ProviderError::AuthError("bad key".to_string()))
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(RetryPolicy::new(
            3,
            Duration::from_millis(1),
            1.0,
            Duration::from_millis(5),
        ));

        let result = executor
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok("ok")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(RetryPolicy::new(
            5,
            Duration::from_millis(1),
            1.0,
            Duration::from_millis(5),
        ));

        let result: Result<()> = executor
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(permanent())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let calls = AtomicU32::new(0);
        let executor = RetryExecutor::new(RetryPolicy::new(
            2,
            Duration::from_millis(1),
            2.0,
            Duration::from_millis(5),
        ));

        let result: Result<()> = executor
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_policy_from_step_policy() {
        let policy = RetryPolicy::from_step_policy(&StepErrorPolicy {
            retry: 3,
            backoff: BackoffStrategy::Exponential,
            fallback: None,
        });
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.multiplier, 2.0);

        let policy = RetryPolicy::from_step_policy(&StepErrorPolicy {
            retry: 1,
            backoff: BackoffStrategy::Linear,
            fallback: None,
        });
        assert_eq!(policy.multiplier, 1.0);
    }

    #[test]
    fn test_delay_growth() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100), 2.0, Duration::from_secs(10));
        let d1 = policy.delay_for(1);
        let d2 = policy.delay_for(2);
        let d3 = policy.delay_for(3);
        assert!(d1 >= Duration::from_millis(100));
        assert!(d2 >= Duration::from_millis(200));
        assert!(d3 >= Duration::from_millis(400));
        // Cap applies
        let capped = RetryPolicy::new(10, Duration::from_secs(5), 2.0, Duration::from_secs(6));
        assert!(capped.delay_for(8) <= Duration::from_millis(6600));
    }
}
