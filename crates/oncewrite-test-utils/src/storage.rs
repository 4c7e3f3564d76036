//! Test key store with operation tracing and failure injection.
//!
//! Wraps [`MemoryKeyStore`] so TTL and CAS semantics are the production ones, and records
//! every call that reached the store for test assertions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use oncewrite_core::error::{Error, Result};
use oncewrite_core::key_store::{
    KeyStore, MemoryKeyStore, StoredValue, WritePrecondition, WriteResult,
};

/// Record of a key store operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Get operation.
    Get {
        /// Key that was read.
        key: String,
    },
    /// Put operation.
    Put {
        /// Key that was written.
        key: String,
        /// Precondition used.
        precondition: WritePrecondition,
        /// Whether the write was applied.
        applied: bool,
    },
    /// Delete operation.
    Delete {
        /// Key that was deleted.
        key: String,
        /// Version guard used.
        expected_version: Option<String>,
    },
}

/// In-memory key store with operation tracing.
///
/// Failures are injected as retryable [`Error::Storage`] errors, the same class a
/// networked store reports for connection loss. A failure is either raised before the
/// call reaches the store, or after a write was applied (a lost acknowledgement).
#[derive(Debug, Clone, Default)]
pub struct TracingKeyStore {
    inner: Arc<MemoryKeyStore>,
    operations: Arc<Mutex<Vec<StoreOp>>>,
    fail_next: Arc<AtomicUsize>,
    lose_acks: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
    injected: Arc<AtomicUsize>,
    latency: Option<Duration>,
}

impl TracingKeyStore {
    /// Creates a new empty tracing store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with simulated latency on every call.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StoreOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Returns how many successful writes were applied.
    #[must_use]
    pub fn applied_writes(&self) -> usize {
        self.operations()
            .iter()
            .filter(|op| matches!(op, StoreOp::Put { applied: true, .. }))
            .count()
    }

    /// Makes the next `n` calls fail with a transient storage error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` applied writes report a transient storage error.
    ///
    /// The write lands; only its acknowledgement is lost. Writes whose precondition
    /// fails are reported normally and do not count.
    pub fn lose_next_acks(&self, n: usize) {
        self.lose_acks.store(n, Ordering::SeqCst);
    }

    /// Makes every call fail until turned off.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns how many calls failed because of injection.
    #[must_use]
    pub fn injected_failures(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    /// Returns the number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if no live keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn record(&self, op: StoreOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, key: &str) -> Result<()> {
        if take_one(&self.fail_next) || self.unavailable.load(Ordering::SeqCst) {
            return Err(self.injected_error(format!("injected failure for key: {key}")));
        }
        Ok(())
    }

    fn injected_error(&self, message: String) -> Error {
        self.injected.fetch_add(1, Ordering::SeqCst);
        Error::storage_with_source(
            message,
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset"),
        )
    }

    async fn maybe_delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl KeyStore for TracingKeyStore {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        self.maybe_delay().await;
        self.check_failure(key)?;
        self.record(StoreOp::Get {
            key: key.to_string(),
        });
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        precondition: WritePrecondition,
        ttl: Duration,
    ) -> Result<WriteResult> {
        self.maybe_delay().await;
        self.check_failure(key)?;
        let result = self.inner.put(key, data, precondition.clone(), ttl).await?;
        let applied = result.is_success();
        self.record(StoreOp::Put {
            key: key.to_string(),
            precondition,
            applied,
        });
        if applied && take_one(&self.lose_acks) {
            return Err(self.injected_error(format!("acknowledgement lost for key: {key}")));
        }
        Ok(result)
    }

    async fn delete(&self, key: &str, expected_version: Option<&str>) -> Result<bool> {
        self.maybe_delay().await;
        self.check_failure(key)?;
        self.record(StoreOp::Delete {
            key: key.to_string(),
            expected_version: expected_version.map(str::to_string),
        });
        self.inner.delete(key, expected_version).await
    }

    async fn sweep_expired(&self) -> Result<usize> {
        self.inner.sweep_expired().await
    }
}
