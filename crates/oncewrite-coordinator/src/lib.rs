//! # oncewrite-coordinator
//!
//! Executes client-keyed writes at most once, even when clients retry after timeouts,
//! connection resets or duplicate submissions.
//!
//! - **Keys**: composite `(identity, operation, token)` keys with token validation
//! - **Fingerprints**: canonical request hashes that detect token reuse with a new payload
//! - **Entries**: the `InProgress -> Completed | Failed` record stored per key
//! - **Store protocol**: claim, finalize, takeover and release over any [`KeyStore`]
//! - **Coordinator**: resolution of existing entries and guarded execution
//!
//! [`KeyStore`]: oncewrite_core::KeyStore
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use oncewrite_core::MemoryKeyStore;
//! use oncewrite_coordinator::{
//!     CoordinatorConfig, Disposition, IdempotencyCoordinator, Operation, Reply,
//!     RequestFingerprint,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = IdempotencyCoordinator::with_key_store(
//!     Arc::new(MemoryKeyStore::new()),
//!     CoordinatorConfig::default(),
//! )?;
//! let operation = Operation::new("create_post")?;
//! let fingerprint = RequestFingerprint::from_json(&serde_json::json!({"content": "hi"}))?;
//!
//! let first = coordinator
//!     .execute("user-1", &operation, Some("create-post-7f3a"), fingerprint.clone(), || async {
//!         Ok::<_, std::io::Error>(Reply::new(201, r#"{"id":"p1"}"#))
//!     })
//!     .await?;
//! let retry = coordinator
//!     .execute("user-1", &operation, Some("create-post-7f3a"), fingerprint, || async {
//!         Ok::<_, std::io::Error>(Reply::new(201, r#"{"id":"p2"}"#))
//!     })
//!     .await?;
//!
//! assert_eq!(first.disposition, Disposition::Executed);
//! assert_eq!(retry.disposition, Disposition::Replayed);
//! assert_eq!(first.payload, retry.payload);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod coordinator;
pub mod entry;
pub mod error;
pub mod fingerprint;
pub mod key;
pub mod metrics;
pub mod retry;
pub mod store;

pub use config::CoordinatorConfig;
pub use coordinator::{
    Disposition, Execution, IdempotencyCheck, IdempotencyCoordinator, Reply,
    calculate_retry_after, check_idempotency,
};
pub use entry::{EntryState, LockEntry};
pub use error::{ExecuteError, IdempotencyError};
pub use fingerprint::{CanonicalizationError, RequestFingerprint};
pub use key::{IdempotencyKey, IdempotencyKeyError, Operation};
pub use retry::RetryPolicy;
pub use store::{
    ClaimResult, EntryVersion, FinalizeResult, IdempotencyStore, KeyStoreIdempotencyStore,
    TakeoverResult,
};
