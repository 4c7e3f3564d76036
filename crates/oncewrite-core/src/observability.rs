//! Observability infrastructure for oncewrite.
//!
//! Structured logging with consistent spans. Every coordinator decision is emitted as a
//! `tracing` event carrying the operation and a hash of the key, never the raw token.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops. If another global subscriber was already
/// installed (for example by a test harness) that subscriber is kept.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `oncewrite_coordinator=debug`)
///
/// # Example
///
/// ```rust
/// use oncewrite_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let installed = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };

        if installed.is_err() {
            tracing::debug!("global subscriber already installed, keeping it");
        }
    });
}

/// Creates a span for one guarded write with standard fields.
///
/// # Example
///
/// ```rust
/// use oncewrite_core::observability::idempotency_span;
///
/// let span = idempotency_span("create_post", "user-42");
/// let _guard = span.enter();
/// // ... run the coordinated write
/// ```
#[must_use]
pub fn idempotency_span(operation: &str, identity: &str) -> Span {
    tracing::info_span!("idempotency", op = operation, identity = identity)
}
