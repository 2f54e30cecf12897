//! Retry policy and backoff.

use super::{classify, RecoveryError};
use crate::error::OperationError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// `base × 2^(n-1)`
    #[default]
    Exponential,
    /// `base × n`
    Linear,
    /// `base`
    Fixed,
}

impl Backoff {
    /// Lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::Fixed => "fixed",
        }
    }
}

impl fmt::Display for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backoff {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            "fixed" | "constant" => Ok(Self::Fixed),
            other => Err(format!("unknown backoff '{other}'")),
        }
    }
}

/// How often and how patiently to retry.
///
/// # Example
///
/// ```
/// use bastion_runtime::recovery::{Backoff, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.backoff, Backoff::Exponential);
/// assert_eq!(policy.delay_for(1), Duration::from_millis(100));
/// assert_eq!(policy.delay_for(2), Duration::from_millis(200));
/// assert_eq!(policy.delay_for(3), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Growth between delays.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = match self.backoff {
            Backoff::Exponential => 2u32
                .checked_pow(attempt - 1)
                .and_then(|factor| self.base_delay.checked_mul(factor)),
            Backoff::Linear => self.base_delay.checked_mul(attempt),
            Backoff::Fixed => Some(self.base_delay),
        };
        delay.map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Boxed retryable operation. Receives the 1-based attempt number.
pub type RetryOperation =
    Box<dyn FnMut(u32) -> BoxFuture<'static, Result<Value, OperationError>> + Send>;

/// Runs `operation` until it succeeds, fails permanently, or the policy is
/// exhausted. `attempts_made` attempts already failed with `error`.
///
/// Returns the value and the attempt number that produced it.
pub(crate) async fn retry(
    policy: &RetryPolicy,
    attempts_made: u32,
    error: OperationError,
    mut operation: RetryOperation,
) -> Result<(Value, u32), RecoveryError> {
    let mut attempt = attempts_made;
    let mut last = error;

    while attempt < policy.max_attempts {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            debug!(attempt, ?delay, "Backing off before retry");
            tokio::time::sleep(delay).await;
        }
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => {
                debug!(attempt, "Retry succeeded");
                return Ok((value, attempt));
            }
            Err(e) => {
                let transient = classify(&e).transient;
                debug!(attempt, transient, error = %e, "Retry attempt failed");
                last = e;
                if !transient {
                    break;
                }
            }
        }
    }

    Err(RecoveryError::Exhausted {
        attempts: attempt,
        last: Box::new(last),
    })
}
