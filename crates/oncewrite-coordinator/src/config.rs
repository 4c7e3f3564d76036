//! Coordinator configuration.

use std::time::Duration;

use oncewrite_core::{Error, Result};

use crate::retry::RetryPolicy;

/// Default lifetime of a completed entry (24 hours).
pub const DEFAULT_COMPLETED_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default age after which an in-progress entry may be reclaimed (5 minutes).
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default storage key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "idempotency";

/// Coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// TTL of completed entries; also bounds the life of abandoned in-progress entries.
    pub completed_ttl: Duration,
    /// Age after which an in-progress entry is presumed abandoned.
    pub stale_timeout: Duration,
    /// How long failed entries are kept for diagnostics. Zero deletes them at once.
    pub failed_retention: Duration,
    /// Prefix for storage keys.
    pub key_prefix: String,
    /// Retry policy for key store calls.
    pub store_retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            completed_ttl: DEFAULT_COMPLETED_TTL,
            stale_timeout: DEFAULT_STALE_TIMEOUT,
            failed_retention: Duration::ZERO,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            store_retry: RetryPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Checks the settings for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the stale timeout is under a second, the
    /// completion TTL does not outlive it, the prefix is empty, or the retry policy
    /// allows no attempts.
    pub fn validate(&self) -> Result<()> {
        if self.stale_timeout < Duration::from_secs(1) {
            return Err(Error::InvalidInput(
                "stale_timeout must be at least 1 second".to_string(),
            ));
        }
        if self.completed_ttl <= self.stale_timeout {
            return Err(Error::InvalidInput(format!(
                "completed_ttl ({}s) must exceed stale_timeout ({}s)",
                self.completed_ttl.as_secs(),
                self.stale_timeout.as_secs()
            )));
        }
        if self.key_prefix.trim_matches('/').is_empty() {
            return Err(Error::InvalidInput("key_prefix must not be empty".to_string()));
        }
        if self.store_retry.max_attempts == 0 {
            return Err(Error::InvalidInput(
                "store_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinatorConfig::default();
        config.validate().expect("defaults valid");
        assert_eq!(config.completed_ttl, Duration::from_secs(86_400));
        assert_eq!(config.stale_timeout, Duration::from_secs(300));
        assert_eq!(config.failed_retention, Duration::ZERO);
        assert_eq!(config.key_prefix, "idempotency");
    }

    #[test]
    fn test_ttl_must_outlive_stale_timeout() {
        let config = CoordinatorConfig {
            completed_ttl: Duration::from_secs(60),
            stale_timeout: Duration::from_secs(300),
            ..CoordinatorConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_sub_second_stale_timeout_rejected() {
        let config = CoordinatorConfig {
            stale_timeout: Duration::from_millis(500),
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = CoordinatorConfig {
            store_retry: RetryPolicy {
                max_attempts: 0,
                ..RetryPolicy::default()
            },
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_prefix_rejected() {
        let config = CoordinatorConfig {
            key_prefix: "/".to_string(),
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
