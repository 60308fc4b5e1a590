//! Bounded retry with exponential backoff for I/O-bound operations.
//!
//! Applied to document conversion and snapshot writes. Only retryable
//! errors (see [`Error::is_retryable`]) are retried; invalid input and
//! parse failures surface immediately.

use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the delay between retries.
    pub max_delay: Duration,
    /// Multiplier applied per retry.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// A fast policy for tests.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 1.0,
        }
    }

    /// Calculates the delay preceding retry attempt `attempt` (1-based
    /// retries; attempt 0 is the initial try and has no delay).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_delay.as_secs_f64()
            * self
                .multiplier
                .powi(i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX));
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

/// Runs `operation` under `policy`, sleeping between attempts.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once attempts
/// are exhausted.
pub fn with_retry<T, F>(policy: &RetryPolicy, operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut last_error: Option<Error> = None;

    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            let delay = policy.delay_for_attempt(attempt);
            debug!(
                "{operation_name}: retry {attempt}/{} after {delay:?}",
                policy.max_attempts - 1
            );
            std::thread::sleep(delay);
        }

        match operation() {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{operation_name}: succeeded after {attempt} retries");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                warn!("{operation_name}: retryable error (attempt {}): {e}", attempt + 1);
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error
        .unwrap_or_else(|| Error::Internal(format!("{operation_name}: no attempts executed"))))
}
