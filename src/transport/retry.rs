//! Bounded retry loop with fixed or exponential backoff

use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// Growth of the delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Every retry waits the configured default delay
    #[default]
    Fixed,
    /// The n-th retry waits `default * 2^(n-1)`
    Exponential,
}

/// Errors the retry loop can classify
pub trait RetryableError: std::error::Error {
    /// Whether another attempt may succeed
    fn is_transient(&self) -> bool;

    /// Delay demanded by the server, overriding the policy's own delay
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// How often and how long to wait between attempts of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub retry_count: u32,
    pub retry_after: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Delay after the `failed_attempts`-th consecutive failure
    pub fn delay_for(&self, failed_attempts: u32, server_hint: Option<Duration>) -> Duration {
        if let Some(hint) = server_hint {
            return hint;
        }
        match self.backoff {
            Backoff::Fixed => self.retry_after,
            Backoff::Exponential => {
                let exponent = failed_attempts.saturating_sub(1).min(16);
                self.retry_after.saturating_mul(1u32 << exponent)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 5,
            retry_after: Duration::from_secs(60),
            backoff: Backoff::Fixed,
        }
    }
}

/// Runs `op` until it succeeds, fails permanently, or the policy is exhausted
///
/// `op` receives the 1-based attempt number. Transient failures are followed
/// by a call to `sleep`; the error of the last attempt is returned unchanged.
pub fn run_with_retry<T, E, F, S>(
    policy: &RetryPolicy,
    target: &str,
    mut sleep: S,
    mut op: F,
) -> Result<T, E>
where
    E: RetryableError,
    F: FnMut(u32) -> Result<T, E>,
    S: FnMut(Duration),
{
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.retry_count => {
                let delay = policy.delay_for(attempt, err.retry_after());
                warn!(
                    "Attempt {}/{} for {} failed: {}; retrying in {}s",
                    attempt,
                    policy.retry_count,
                    target,
                    err,
                    delay.as_secs()
                );
                sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
