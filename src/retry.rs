//! Exponential backoff shared by the store client (page reads) and the bulk writer (batches and
//! individual items).

use serde::{Deserialize, Serialize};
use std::{future::Future, time::Duration};

use crate::error::SweepersError;

/// Parameters for one retry ceiling. `max_attempts` counts the first try, so `1` disables retries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // tries=6, delay=2s, backoff=2 in the legacy sweepers
        RetryPolicy {
            max_attempts: 6,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, multiplier: f64) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay_ms,
            multiplier,
            ..Default::default()
        }
    }

    /// A policy that never waits, for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
        }
    }

    /// Delay to wait before retry number `retry` (0 for the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let millis = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts.max(1)
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the policy is exhausted.
/// The closure receives the zero-based attempt number.
pub async fn retry_async<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, SweepersError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SweepersError>>,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && policy.allows_another(attempt + 1) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "{label} failed (attempt {}/{}): {err}; retrying in {:?}",
                    attempt + 1,
                    policy.max_attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::error!(
                        "{label} failed after {} attempts: {err}",
                        attempt + 1
                    );
                }
                return Err(err);
            }
        }
    }
}
