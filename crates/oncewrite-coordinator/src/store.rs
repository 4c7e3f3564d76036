//! Entry store protocol over a [`KeyStore`].
//!
//! Every state change is a single atomic key store operation:
//! - claim: create-if-absent of an `InProgress` entry
//! - finalize: compare-and-replace to `Completed` or `Failed`
//! - takeover: compare-and-replace of a stale or failed entry with a fresh `InProgress` one
//! - release: version-guarded delete after a work failure
//!
//! Takeover never deletes and re-creates, so two reclaimers cannot both win.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oncewrite_core::{KeyStore, WriteResult};

use crate::config::CoordinatorConfig;
use crate::entry::{EntryState, LockEntry};
use crate::error::{IdempotencyError, Result};
use crate::fingerprint::RequestFingerprint;
use crate::key::IdempotencyKey;
use crate::retry::{RetryPolicy, with_store_retry};

/// Create attempts in `claim` when the existing entry vanishes before it can be read.
const MAX_CLAIM_ATTEMPTS: u32 = 3;

/// Entry version for CAS operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryVersion(String);

impl EntryVersion {
    /// Creates a new entry version.
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// Returns the version as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Result of attempting to claim a key.
#[derive(Debug, Clone)]
pub enum ClaimResult {
    /// The entry was created; the caller owns the key.
    Claimed {
        /// Version of the written entry.
        version: EntryVersion,
    },
    /// An entry already exists.
    Exists {
        /// The existing entry (boxed to reduce enum size).
        entry: Box<LockEntry>,
        /// Version of the existing entry.
        version: EntryVersion,
    },
}

/// Result of a finalize operation.
#[derive(Debug, Clone)]
pub enum FinalizeResult {
    /// The entry was replaced.
    Success {
        /// New version after finalization.
        version: EntryVersion,
    },
    /// The entry changed underneath (reclaimed by another attempt, or expired).
    Conflict {
        /// Current version, `None` if the entry is gone.
        current_version: Option<EntryVersion>,
    },
}

/// Result of a takeover attempt.
#[derive(Debug, Clone)]
pub enum TakeoverResult {
    /// The entry was replaced by a fresh in-progress entry owned by the caller.
    Success {
        /// The fresh entry.
        entry: LockEntry,
        /// New version after takeover.
        version: EntryVersion,
    },
    /// CAS failed - the entry was modified concurrently.
    RaceDetected {
        /// Current entry after the race.
        current_entry: Box<LockEntry>,
        /// Current version.
        current_version: EntryVersion,
    },
    /// CAS failed and the entry is gone; the key can be claimed again.
    Vanished,
}

/// Storage operations on lock entries.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically creates `entry` under `key` if no entry exists.
    async fn claim(&self, key: &IdempotencyKey, entry: &LockEntry) -> Result<ClaimResult>;

    /// Loads the current entry.
    async fn load(&self, key: &IdempotencyKey) -> Result<Option<(LockEntry, EntryVersion)>>;

    /// Replaces an in-progress entry with its finalized form (`Completed` or `Failed`).
    async fn finalize(
        &self,
        key: &IdempotencyKey,
        entry: &LockEntry,
        expected_version: &EntryVersion,
    ) -> Result<FinalizeResult>;

    /// Replaces a stale in-progress or failed entry with a fresh in-progress entry.
    async fn takeover(
        &self,
        key: &IdempotencyKey,
        current: &LockEntry,
        fingerprint: &RequestFingerprint,
        expected_version: &EntryVersion,
    ) -> Result<TakeoverResult>;

    /// Deletes the entry if it still has `expected_version`.
    async fn release(&self, key: &IdempotencyKey, expected_version: &EntryVersion) -> Result<bool>;
}

/// [`IdempotencyStore`] for any [`KeyStore`].
pub struct KeyStoreIdempotencyStore<S: ?Sized> {
    store: Arc<S>,
    prefix: String,
    completed_ttl: Duration,
    failed_retention: Duration,
    retry: RetryPolicy,
}

impl<S: KeyStore + ?Sized> KeyStoreIdempotencyStore<S> {
    /// Creates a store using the TTLs, prefix and retry policy from `config`.
    #[must_use]
    pub fn new(store: Arc<S>, config: &CoordinatorConfig) -> Self {
        Self {
            store,
            prefix: config.key_prefix.clone(),
            completed_ttl: config.completed_ttl,
            failed_retention: config.failed_retention,
            retry: config.store_retry.clone(),
        }
    }

    /// Returns the underlying key store.
    #[must_use]
    pub fn key_store(&self) -> &Arc<S> {
        &self.store
    }

    fn path(&self, key: &IdempotencyKey) -> String {
        key.storage_key(&self.prefix)
    }

    fn ttl_for(&self, entry: &LockEntry) -> Result<Duration> {
        match entry.state {
            // In-progress entries share the completion TTL so abandoned ones still expire.
            EntryState::InProgress | EntryState::Completed => Ok(self.completed_ttl),
            EntryState::Failed if self.failed_retention.is_zero() => {
                Err(IdempotencyError::InvariantViolation {
                    message: "failed entries are not retained; release instead".to_string(),
                })
            }
            EntryState::Failed => Ok(self.failed_retention),
        }
    }

    async fn read(&self, path: &str) -> Result<Option<(LockEntry, EntryVersion)>> {
        let value = with_store_retry(&self.retry, "get", || self.store.get(path)).await?;
        value
            .map(|v| Ok((LockEntry::from_bytes(path, &v.data)?, EntryVersion::new(v.version))))
            .transpose()
    }

    async fn replace(
        &self,
        path: &str,
        entry: &LockEntry,
        expected_version: &EntryVersion,
    ) -> Result<WriteResult> {
        let bytes = entry.to_bytes()?;
        let ttl = self.ttl_for(entry)?;
        let result = with_store_retry(&self.retry, "compare_and_replace", || {
            self.store
                .compare_and_replace(path, expected_version.as_str(), bytes.clone(), ttl)
        })
        .await?;
        Ok(result)
    }
}

#[async_trait]
impl<S: KeyStore + ?Sized> IdempotencyStore for KeyStoreIdempotencyStore<S> {
    async fn claim(&self, key: &IdempotencyKey, entry: &LockEntry) -> Result<ClaimResult> {
        let path = self.path(key);
        let bytes = entry.to_bytes()?;
        let ttl = self.ttl_for(entry)?;

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let result = with_store_retry(&self.retry, "create_if_absent", || {
                self.store.create_if_absent(&path, bytes.clone(), ttl)
            })
            .await?;

            match result {
                WriteResult::Success { version } => {
                    return Ok(ClaimResult::Claimed {
                        version: EntryVersion::new(version),
                    });
                }
                WriteResult::PreconditionFailed { .. } => {
                    if let Some((existing, version)) = self.read(&path).await? {
                        return Ok(ClaimResult::Exists {
                            entry: Box::new(existing),
                            version,
                        });
                    }
                    // Expired or released between the create and the read
                    tracing::debug!(
                        key_hash = key.key_hash(),
                        operation = %key.operation(),
                        "Idempotency entry vanished during claim, retrying create"
                    );
                }
            }
        }

        Err(IdempotencyError::Contention {
            rounds: MAX_CLAIM_ATTEMPTS,
        })
    }

    async fn load(&self, key: &IdempotencyKey) -> Result<Option<(LockEntry, EntryVersion)>> {
        self.read(&self.path(key)).await
    }

    async fn finalize(
        &self,
        key: &IdempotencyKey,
        entry: &LockEntry,
        expected_version: &EntryVersion,
    ) -> Result<FinalizeResult> {
        if entry.state == EntryState::InProgress {
            return Err(IdempotencyError::InvariantViolation {
                message: "finalize requires a completed or failed entry".to_string(),
            });
        }

        let path = self.path(key);
        match self.replace(&path, entry, expected_version).await? {
            WriteResult::Success { version } => Ok(FinalizeResult::Success {
                version: EntryVersion::new(version),
            }),
            WriteResult::PreconditionFailed { current_version } => {
                // A retried write may have landed before its acknowledgement was lost.
                if let Some((current, version)) = self.read(&path).await? {
                    if current.owner_id == entry.owner_id && current.state == entry.state {
                        return Ok(FinalizeResult::Success { version });
                    }
                }
                Ok(FinalizeResult::Conflict {
                    current_version: current_version.map(EntryVersion::new),
                })
            }
        }
    }

    async fn takeover(
        &self,
        key: &IdempotencyKey,
        current: &LockEntry,
        fingerprint: &RequestFingerprint,
        expected_version: &EntryVersion,
    ) -> Result<TakeoverResult> {
        let refreshed = current.reclaimed(fingerprint.clone());
        let path = self.path(key);

        match self.replace(&path, &refreshed, expected_version).await? {
            WriteResult::Success { version } => Ok(TakeoverResult::Success {
                entry: refreshed,
                version: EntryVersion::new(version),
            }),
            WriteResult::PreconditionFailed { .. } => match self.read(&path).await? {
                Some((entry, version)) if entry.owner_id == refreshed.owner_id => {
                    Ok(TakeoverResult::Success { entry, version })
                }
                Some((entry, version)) => Ok(TakeoverResult::RaceDetected {
                    current_entry: Box::new(entry),
                    current_version: version,
                }),
                None => Ok(TakeoverResult::Vanished),
            },
        }
    }

    async fn release(&self, key: &IdempotencyKey, expected_version: &EntryVersion) -> Result<bool> {
        let path = self.path(key);
        let deleted = with_store_retry(&self.retry, "delete", || {
            self.store.delete(&path, Some(expected_version.as_str()))
        })
        .await?;
        Ok(deleted)
    }
}
