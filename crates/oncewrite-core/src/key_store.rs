//! Key store abstraction for the shared idempotency backend.
//!
//! The coordinator needs exactly four things from its backing store:
//! - **create-if-absent**: atomic insert that succeeds for one writer only
//! - **get**: read the current value together with its version token
//! - **compare-and-replace**: overwrite only if the version still matches
//! - **delete**: remove a key, optionally guarded by its version
//!
//! Every write carries a TTL. An expired key is indistinguishable from an absent one.
//!
//! ## Version Tokens
//!
//! Version tokens are opaque strings so that different backends can map them onto
//! their own CAS primitive (a Redis `WATCH` revision, an object generation, a row
//! version). A store must never hand out the same token twice for the same key, even
//! across a delete and re-create, otherwise a stale compare-and-replace could succeed
//! against a fresh entry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if the key does not exist (or has expired).
    DoesNotExist,
    /// Write only if the key's current version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns the new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed.
    PreconditionFailed {
        /// The current version that caused the precondition to fail, `None` if the key
        /// is absent.
        current_version: Option<String>,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A value read from the store along with its version token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    /// The stored bytes.
    pub data: Bytes,
    /// Opaque version token for compare-and-replace.
    pub version: String,
}

/// Shared key/value backend with atomic conditional writes and TTL expiry.
///
/// Implementations must be linearizable per key and provide read-after-write
/// consistency: once a write returns `Success`, every subsequent `get` observes it.
#[async_trait]
pub trait KeyStore: Send + Sync + 'static {
    /// Reads a key.
    ///
    /// Returns `None` if the key does not exist or has expired.
    async fn get(&self, key: &str) -> Result<Option<StoredValue>>;

    /// Writes with a precondition and a TTL.
    ///
    /// Returns `WriteResult::PreconditionFailed` if the precondition is not met.
    /// Never returns an error for precondition failure - that's a normal result.
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        precondition: WritePrecondition,
        ttl: Duration,
    ) -> Result<WriteResult>;

    /// Deletes a key.
    ///
    /// With `expected_version`, the delete only happens if the current version matches.
    /// Returns whether a live key was removed. Deleting an absent key is not an error.
    async fn delete(&self, key: &str, expected_version: Option<&str>) -> Result<bool>;

    /// Drops expired keys, returning how many were removed.
    ///
    /// Stores that expire keys natively have nothing to do here.
    async fn sweep_expired(&self) -> Result<usize> {
        Ok(0)
    }

    /// Atomically creates a key only if it is absent.
    async fn create_if_absent(&self, key: &str, data: Bytes, ttl: Duration) -> Result<WriteResult> {
        self.put(key, data, WritePrecondition::DoesNotExist, ttl)
            .await
    }

    /// Atomically replaces a key only if its version still matches `expected_version`.
    async fn compare_and_replace(
        &self,
        key: &str,
        expected_version: &str,
        data: Bytes,
        ttl: Duration,
    ) -> Result<WriteResult> {
        self.put(
            key,
            data,
            WritePrecondition::MatchesVersion(expected_version.to_string()),
            ttl,
        )
        .await
    }
}

/// In-memory key store.
///
/// Thread-safe via `RwLock`. Suitable for tests and single-process development only:
/// horizontally scaled coordinators must share a networked store.
///
/// Expiry is measured on the tokio clock, so tests can pause and advance time.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    inner: Arc<RwLock<Entries>>,
}

#[derive(Debug, Default)]
struct Entries {
    objects: HashMap<String, StoredObject>,
    // Store-wide counter so versions are never reused after delete + re-create.
    next_version: u64,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: u64,
    expires_at: Instant,
}

impl StoredObject {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

impl MemoryKeyStore {
    /// Creates a new empty memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live (unexpired) keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .read()
            .map(|entries| entries.objects.values().filter(|o| o.is_live(now)).count())
            .unwrap_or(0)
    }

    /// Returns true if no live keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops expired keys, returning how many were removed.
    ///
    /// Expired keys are already invisible to readers; this only reclaims memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.inner.write().map_err(|_| poisoned())?;
        let before = entries.objects.len();
        entries.objects.retain(|_, o| o.is_live(now));
        Ok(before - entries.objects.len())
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60))
}

/// Spawns a task that calls [`KeyStore::sweep_expired`] every `every`.
///
/// Expired keys are already invisible to readers, but an in-memory store keeps them
/// until something removes them. The task runs until its handle is aborted.
pub fn spawn_expiry_sweep(store: Arc<dyn KeyStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match store.sweep_expired().await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "Swept expired keys"),
                Err(e) => tracing::warn!(error = %e, "Expiry sweep failed"),
            }
        }
    })
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        let now = Instant::now();
        let entries = self.inner.read().map_err(|_| poisoned())?;

        Ok(entries
            .objects
            .get(key)
            .filter(|o| o.is_live(now))
            .map(|o| StoredValue {
                data: o.data.clone(),
                version: o.version.to_string(),
            }))
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        precondition: WritePrecondition,
        ttl: Duration,
    ) -> Result<WriteResult> {
        if ttl.is_zero() {
            return Err(Error::InvalidInput(format!("ttl must be positive for key {key}")));
        }

        let now = Instant::now();
        let mut entries = self.inner.write().map_err(|_| poisoned())?;
        let current = entries.objects.get(key).filter(|o| o.is_live(now));

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: Some(obj.version.to_string()),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => match current {
                Some(obj) if obj.version.to_string() == expected => {}
                Some(obj) => {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: Some(obj.version.to_string()),
                    });
                }
                None => {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: None,
                    });
                }
            },
            WritePrecondition::None => {}
        }

        entries.next_version += 1;
        let version = entries.next_version;
        entries.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                version,
                expires_at: expiry(now, ttl),
            },
        );
        drop(entries);

        Ok(WriteResult::Success {
            version: version.to_string(),
        })
    }

    async fn delete(&self, key: &str, expected_version: Option<&str>) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.inner.write().map_err(|_| poisoned())?;

        let live_version = entries
            .objects
            .get(key)
            .filter(|o| o.is_live(now))
            .map(|o| o.version.to_string());

        match (live_version, expected_version) {
            (None, _) => {
                // Expired leftovers are dropped regardless of the guard.
                entries.objects.remove(key);
                Ok(false)
            }
            (Some(current), Some(expected)) if current != expected => Ok(false),
            (Some(_), _) => {
                entries.objects.remove(key);
                Ok(true)
            }
        }
    }

    async fn sweep_expired(&self) -> Result<usize> {
        self.purge_expired()
    }
}
