//! Bounded retry with exponential backoff, jitter and cancellation.
//!
//! Every remote call in this crate runs under a caller-supplied
//! [`CancellationToken`]. Loops that re-issue a call (the virtual-service
//! Pending loop and the shared-record conflict loop) are bounded by a
//! [`RetryConfig`]; there is no unbounded polling anywhere.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::{GatewayError, Result};

/// Default attempt budget for Pending retries
pub const DEFAULT_PENDING_ATTEMPTS: u32 = 5;

/// Default attempt budget for shared-record write conflicts
pub const DEFAULT_CONFLICT_ATTEMPTS: u32 = 10;

/// Retry budget and backoff policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Randomize each delay to 0.5x..1.5x
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_PENDING_ATTEMPTS,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// No waiting between attempts. Used by tests and the dry-run backend.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Un-jittered delay after the given (1-based) failed attempt
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()).max(0.0))
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(base.as_secs_f64() * jitter)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Run a future unless the token fires first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(GatewayError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        res = fut => res,
    }
}

async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    if delay.is_zero() {
        return if cancel.is_cancelled() {
            Err(GatewayError::Cancelled)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Re-issue `operation` while `should_retry` accepts its error, up to the
/// attempt budget. The closure receives the 1-based attempt number.
///
/// Returns the first success, the first non-retryable error, or the last
/// retryable error once the budget is spent.
pub async fn retry_while<T, F, Fut, P>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&GatewayError) -> bool,
{
    let budget = config.attempts();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match cancellable(cancel, operation(attempt)).await {
            Ok(value) => return Ok(value),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => {
                if attempt >= budget {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = config.delay(attempt);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                sleep_or_cancel(cancel, delay).await?;
            }
        }
    }
}
