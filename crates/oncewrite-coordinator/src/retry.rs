//! Bounded retry of key store calls.
//!
//! Only connectivity failures ([`oncewrite_core::Error::is_retryable`]) are retried. A
//! failed precondition is a normal result and never reaches this layer as an error.

use std::future::Future;
use std::time::Duration;

use oncewrite_core::Result;

use crate::metrics::record_store_retry;

/// Default number of attempts per store call (including the first).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default initial backoff.
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(50);

/// Default backoff cap.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Retry policy for key store calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per call, including the first. Must be at least 1.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles afterwards.
    pub base_backoff: Duration,
    /// Upper bound for a single backoff.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (1-based), without jitter.
    #[must_use]
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Runs `call` until it succeeds, fails permanently, or the attempts run out.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, or the first non-retryable error.
pub async fn with_store_retry<T, F, Fut>(policy: &RetryPolicy, op: &'static str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff_for(attempt) + rand_jitter(policy.base_backoff);
                tracing::warn!(
                    op,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Key store call failed, retrying"
                );
                record_store_retry(op);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn rand_jitter(base: Duration) -> Duration {
    use std::time::SystemTime;

    let bound = u64::try_from(base.as_millis() / 2).unwrap_or(u64::MAX).max(1);
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    Duration::from_millis(seed % bound)
}
