//! Exponential backoff for transient failures
//!
//! Only errors whose [`RelayerError::is_retryable`] is true are retried.
//! Validation and authenticity failures surface on the first attempt.

use crate::config::RetryConfig;
use crate::error::{RelayerError, RelayerResult};

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
        }
    }
}

impl RetryPolicy {
    /// Policy without delays, for callers that pace themselves
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt cap is hit
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> RelayerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayerResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        warn!(
                            "{} failed after {} attempts, giving up: {}",
                            operation, attempt, e
                        );
                        crate::metrics::record_retries_exhausted(operation);
                        return Err(RelayerError::RetriesExhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    let delay = self.backoff_for_attempt(attempt - 1);
                    debug!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        operation, attempt, self.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
