//! Capped exponential backoff for transient storage failures.

use crate::config::TransferConfig;
use crate::utils::errors::{ArchiveError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: config.initial_backoff(),
            max_delay: config.max_backoff(),
            multiplier: config.backoff_multiplier.max(1.0),
        }
    }

    /// Delay after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}

/// Run `op` until it succeeds, fails permanently or runs out of attempts.
///
/// Only [`ArchiveError::TransientStorage`] is retried. Exhausting the
/// attempts turns the last transient error into a permanent one.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {}ms: {}",
                    what,
                    attempt,
                    policy.max_attempts,
                    delay.as_millis(),
                    e
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
                }
                attempt += 1;
            }
            Err(e) if e.is_transient() => {
                return Err(ArchiveError::PermanentStorage(format!(
                    "{} gave up after {} attempts: {}",
                    what, attempt, e
                )));
            }
            Err(e) => return Err(e),
        }
    }
}
