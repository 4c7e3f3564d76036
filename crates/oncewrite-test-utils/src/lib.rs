//! Shared test utilities for oncewrite integration tests.
//!
//! This crate provides:
//! - [`TracingKeyStore`]: In-memory key store with operation recording, failure
//!   injection and latency
//! - [`WorkProbe`]: A stand-in unit of work that counts invocations and can be scripted
//!   to fail or to block until released
//!
//! # Example
//!
//! ```rust,ignore
//! use oncewrite_test_utils::{TracingKeyStore, WorkProbe};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let store = Arc::new(TracingKeyStore::new());
//!     let probe = Arc::new(WorkProbe::new());
//!     // ... run the coordinator against `store`, calling `probe.invoke()` as the work ...
//!     assert_eq!(probe.calls(), 1);
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod storage;

pub use fixtures::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("oncewrite=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
