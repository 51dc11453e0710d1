use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backoff::{backoff::Backoff, exponential::ExponentialBackoff, SystemClock};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Attempt budget and exponential backoff with jitter, shared by the fetcher and
/// the reasoning calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Randomization factor in [0, 1]: each delay lands in `delay * (1 ± jitter)`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Policy with no waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    fn backoff(&self) -> ExponentialBackoff<SystemClock> {
        let initial = Duration::from_millis(self.initial_backoff_ms);
        ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            randomization_factor: self.jitter,
            multiplier: self.multiplier,
            max_interval: Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms)),
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Runs `op` until it succeeds, fails permanently, or the attempt budget is spent.
/// Returns the last result together with the number of attempts made.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> (Result<T, E>, u32)
where
    E: Retryable + Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = policy.backoff();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return (Ok(value), attempt),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = backoff
                    .next_backoff()
                    .unwrap_or_else(|| Duration::from_millis(policy.max_backoff_ms));
                warn!(operation, attempt, max_attempts, ?delay, error = %e, "attempt failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}
