//! Server configuration.

use std::time::Duration;

use oncewrite_coordinator::CoordinatorConfig;
use oncewrite_core::{Error, Result};

/// Minimum accepted `ONCEWRITE_IDEMPOTENCY_STALE_TIMEOUT_SECS`.
pub const MIN_IDEMPOTENCY_STALE_TIMEOUT_SECS: u64 = 10;

/// Maximum accepted `ONCEWRITE_IDEMPOTENCY_STALE_TIMEOUT_SECS`.
pub const MAX_IDEMPOTENCY_STALE_TIMEOUT_SECS: u64 = 3600;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub http_port: u16,

    /// Enable debug mode (human-readable logs).
    pub debug: bool,

    /// Idempotency coordinator settings.
    pub idempotency: CoordinatorConfig,

    /// How often expired keys are swept from the key store.
    pub expiry_sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            debug: false,
            idempotency: CoordinatorConfig::default(),
            expiry_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Supported env vars:
    /// - `ONCEWRITE_HTTP_PORT`
    /// - `ONCEWRITE_DEBUG`
    /// - `ONCEWRITE_IDEMPOTENCY_TTL_SECS`
    /// - `ONCEWRITE_IDEMPOTENCY_STALE_TIMEOUT_SECS` (10-3600, default: 300)
    /// - `ONCEWRITE_IDEMPOTENCY_FAILED_RETENTION_SECS` (0 deletes failed entries)
    /// - `ONCEWRITE_IDEMPOTENCY_KEY_PREFIX`
    /// - `ONCEWRITE_STORE_RETRY_ATTEMPTS`
    /// - `ONCEWRITE_EXPIRY_SWEEP_SECS` (default: 60)
    ///
    /// # Errors
    ///
    /// Returns an error if any environment variable is present but cannot be parsed, or
    /// the resulting coordinator settings are inconsistent.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`Config::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(port) = env.u16("ONCEWRITE_HTTP_PORT")? {
            config.http_port = port;
        }
        if let Some(debug) = env.bool("ONCEWRITE_DEBUG")? {
            config.debug = debug;
        }

        if let Some(secs) = env.u64("ONCEWRITE_IDEMPOTENCY_TTL_SECS")? {
            config.idempotency.completed_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env.u64("ONCEWRITE_IDEMPOTENCY_STALE_TIMEOUT_SECS")? {
            if secs < MIN_IDEMPOTENCY_STALE_TIMEOUT_SECS {
                return Err(Error::InvalidInput(format!(
                    "ONCEWRITE_IDEMPOTENCY_STALE_TIMEOUT_SECS must be at least {MIN_IDEMPOTENCY_STALE_TIMEOUT_SECS} seconds"
                )));
            }
            if secs > MAX_IDEMPOTENCY_STALE_TIMEOUT_SECS {
                return Err(Error::InvalidInput(format!(
                    "ONCEWRITE_IDEMPOTENCY_STALE_TIMEOUT_SECS must be at most {MAX_IDEMPOTENCY_STALE_TIMEOUT_SECS} seconds"
                )));
            }
            config.idempotency.stale_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env.u64("ONCEWRITE_IDEMPOTENCY_FAILED_RETENTION_SECS")? {
            config.idempotency.failed_retention = Duration::from_secs(secs);
        }
        if let Some(prefix) = env.string("ONCEWRITE_IDEMPOTENCY_KEY_PREFIX") {
            config.idempotency.key_prefix = prefix;
        }
        if let Some(attempts) = env.u32("ONCEWRITE_STORE_RETRY_ATTEMPTS")? {
            config.idempotency.store_retry.max_attempts = attempts;
        }

        if let Some(secs) = env.u64("ONCEWRITE_EXPIRY_SWEEP_SECS")? {
            if secs == 0 {
                return Err(Error::InvalidInput(
                    "ONCEWRITE_EXPIRY_SWEEP_SECS must be at least 1 second".to_string(),
                ));
            }
            config.expiry_sweep_interval = Duration::from_secs(secs);
        }

        config.idempotency.validate()?;
        Ok(config)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u16(&self, name: &str) -> Result<Option<u16>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u16>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u16: {e}")))
    }

    fn u32(&self, name: &str) -> Result<Option<u32>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u32>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u32: {e}")))
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}
