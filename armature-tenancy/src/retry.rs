//! Retry with exponential backoff.
//!
//! Used for lock acquisition and for whole migration or offboarding
//! attempts. The delay doubles after every failed attempt and is capped at
//! `max_interval`.
//!
//! ## Example
//!
//! ```rust,ignore
//! let policy = RetryPolicy::default().max_retries(3);
//! let mut backoff = policy.backoff("acquire lock");
//!
//! loop {
//!     match try_something().await {
//!         Ok(v) => break Ok(v),
//!         Err(e) if e.is_retryable() && backoff.wait(&e).await => continue,
//!         Err(e) => break Err(backoff.exhausted(e)),
//!     }
//! }
//! ```

use crate::error::TenancyError;
use crate::logging::{debug, log_warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 6;

/// Default delay before the first retry.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

/// Default cap on the delay between retries.
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Upper bound for any single delay.
    #[serde(default = "default_max_interval", with = "humantime_serde")]
    pub max_interval: Duration,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_max_interval() -> Duration {
    DEFAULT_MAX_INTERVAL
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            interval: DEFAULT_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(max_retries: u32, interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
            max_interval,
        }
    }

    /// Set the number of retries.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the initial delay.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the delay cap.
    pub fn max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    /// Delay before retry number `retry` (0-indexed).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.interval
            .checked_mul(factor)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }

    /// Start tracking a single operation.
    pub fn backoff(&self, operation: &'static str) -> Backoff {
        Backoff {
            policy: *self,
            operation,
            attempts: 1,
        }
    }

    /// Rough upper bound on the total time spent sleeping.
    pub fn total_delay(&self) -> Duration {
        (0..self.max_retries).map(|n| self.delay_for_attempt(n)).sum()
    }
}

/// Attempt counter for one retried operation.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    operation: &'static str,
    attempts: u32,
}

impl Backoff {
    /// Attempts made so far, counting the first.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Next delay, or `None` once the retries are spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let retry = self.attempts - 1;
        if retry >= self.policy.max_retries {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay_for_attempt(retry))
    }

    /// Sleep before the next attempt. Returns `false` when retries are spent.
    pub async fn wait(&mut self, error: &TenancyError) -> bool {
        let failed_attempt = self.attempts;
        match self.next_delay() {
            Some(delay) => {
                debug!(
                    operation = self.operation,
                    attempt = failed_attempt,
                    max_retries = self.policy.max_retries,
                    delay = ?delay,
                    error = %error,
                    "attempt failed, retrying"
                );
                if delay > Duration::ZERO {
                    tokio::time::sleep(delay).await;
                }
                true
            }
            None => {
                log_warn!(
                    operation = self.operation,
                    attempts = failed_attempt,
                    error = %error,
                    "final attempt failed"
                );
                false
            }
        }
    }

    /// Wrap the last error with the attempt count.
    pub fn exhausted(&self, error: TenancyError) -> TenancyError {
        if self.attempts <= 1 {
            return error;
        }
        TenancyError::RetryExhausted {
            attempts: self.attempts,
            source: Box::new(error),
        }
    }
}
