//! Retry and timeout wrappers for collaborator calls.
//!
//! Only [`ErrorClass::Transient`] failures are retried; every other class is
//! returned to the caller immediately. Backoff doubles per attempt, capped,
//! with a random jitter so parallel reviewers do not hammer a rate-limited
//! endpoint in lockstep.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::errors::{ErrorClass, StageError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: crate::config::DEFAULT_RETRY_ATTEMPTS,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before the next attempt: exponential, capped, jittered.
    fn delay_for(&self, completed_attempts: u32) -> Duration {
        let exp = completed_attempts.saturating_sub(1).min(16);
        let base = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let jitter_ceiling = (base.as_millis() as u64 / 2).max(1);
        let jitter = rand::rng().random_range(0..jitter_ceiling);
        base + Duration::from_millis(jitter)
    }
}

/// Run `op` up to `policy.attempts` times, backing off between transient
/// failures.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    call: &str,
    mut op: F,
) -> Result<T, StageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.class() == ErrorClass::Transient && attempt < policy.attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    call,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Bound a collaborator future by a wall-clock timeout, mapping expiry to a
/// retryable [`StageError::Timeout`].
pub async fn bounded<T, Fut>(call: &str, limit: Duration, fut: Fut) -> Result<T, StageError>
where
    Fut: Future<Output = Result<T, StageError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StageError::Timeout {
            call: call.to_string(),
            seconds: limit.as_secs(),
        }),
    }
}
