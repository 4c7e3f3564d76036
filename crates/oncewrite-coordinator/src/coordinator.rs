//! At-most-once execution of keyed writes.
//!
//! ## Protocol
//!
//! 1. No token: the write runs unguarded
//! 2. Claim the composite key by creating an `InProgress` entry (`DoesNotExist`)
//!    - Claimed: run the work, then finalize the entry to `Completed`
//!    - Exists: resolve the existing entry (see [`check_idempotency`])
//! 3. On work failure the entry is released (or marked `Failed` when retention is on)
//!    so a later retry runs the work again
//!
//! The key store's atomic operations are the only arbitration point, so any number of
//! coordinator instances can share one store.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use oncewrite_core::KeyStore;
use tokio::task::JoinError;

use crate::config::CoordinatorConfig;
use crate::entry::{EntryState, LockEntry, to_chrono};
use crate::error::{ExecuteError, IdempotencyError, Result};
use crate::fingerprint::RequestFingerprint;
use crate::key::{IdempotencyKey, Operation};
use crate::metrics::{record_idempotency_check, record_idempotency_reclaim, record_work_duration};
use crate::store::{
    ClaimResult, EntryVersion, FinalizeResult, IdempotencyStore, KeyStoreIdempotencyStore,
    TakeoverResult,
};

/// Rounds of lost races tolerated while resolving an existing entry.
const MAX_RESOLUTION_ROUNDS: u32 = 8;

/// Calculates Retry-After value with jitter to prevent thundering herd.
///
/// Returns remaining time until the entry becomes stale, with +0% to +20% jitter,
/// clamped to `[1, 300]` seconds. Jitter is non-negative so clients retry
/// at or after the stale deadline.
#[must_use]
pub fn calculate_retry_after(started_at: DateTime<Utc>, stale_timeout: Duration) -> u64 {
    calculate_retry_after_at(Utc::now(), started_at, stale_timeout)
}

#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn calculate_retry_after_at(
    now: DateTime<Utc>,
    started_at: DateTime<Utc>,
    stale_timeout: Duration,
) -> u64 {
    let elapsed = now.signed_duration_since(started_at);
    let remaining_secs = (to_chrono(stale_timeout) - elapsed).num_seconds().max(0) as f64;

    let nanos = f64::from(now.timestamp_subsec_nanos());
    let jitter_factor = nanos.mul_add(0.2 / 1_000_000_000.0, 1.0);
    let with_jitter = (remaining_secs * jitter_factor) as u64;

    with_jitter.clamp(1, 300)
}

/// Result of resolving a key.
#[derive(Debug)]
pub enum IdempotencyCheck {
    /// The caller owns the key and must run the work, then finalize.
    Proceed {
        /// The owned in-progress entry.
        entry: LockEntry,
        /// Version of the entry for finalization.
        version: EntryVersion,
        /// Whether ownership came from reclaiming a stale or failed entry.
        reclaimed: bool,
    },
    /// Idempotent replay - return the stored reply.
    Replay {
        /// Stored status code.
        status: u16,
        /// Stored payload.
        payload: Bytes,
    },
    /// Another attempt is running.
    InProgress {
        /// When the running attempt started (for Retry-After calculation).
        started_at: DateTime<Utc>,
    },
    /// The key was used with a different request payload.
    Conflict,
}

impl IdempotencyCheck {
    fn outcome(&self) -> &'static str {
        match self {
            Self::Proceed { .. } => "proceed",
            Self::Replay { .. } => "replay",
            Self::InProgress { .. } => "in_progress",
            Self::Conflict => "conflict",
        }
    }
}

/// Claims `key`, or resolves the entry that already holds it.
///
/// | Existing entry            | Fingerprint | Result                              |
/// |---------------------------|-------------|-------------------------------------|
/// | none                      | -           | `Proceed`                           |
/// | `InProgress`, fresh       | any         | `InProgress`                        |
/// | `InProgress`, stale       | any         | reclaim; winner gets `Proceed`      |
/// | `Completed`               | match       | `Replay`                            |
/// | `Completed`               | mismatch    | `Conflict`                          |
/// | `Failed`                  | any         | reclaim; winner gets `Proceed`      |
///
/// Only a `Completed` entry is compared against the fingerprint. A stale entry never
/// produced a reply, so the reclaimer's payload replaces it.
///
/// A reclaimer that loses the race re-resolves against whatever won.
///
/// # Errors
///
/// Returns an error if the store is unavailable, an entry is corrupt, or the key stays
/// contended for too many rounds.
pub async fn check_idempotency(
    store: &dyn IdempotencyStore,
    key: &IdempotencyKey,
    fingerprint: &RequestFingerprint,
    stale_timeout: Duration,
) -> Result<IdempotencyCheck> {
    let op = key.operation().as_str();
    let result = resolve(store, key, fingerprint, stale_timeout).await?;
    record_idempotency_check(op, result.outcome());
    Ok(result)
}

async fn resolve(
    store: &dyn IdempotencyStore,
    key: &IdempotencyKey,
    fingerprint: &RequestFingerprint,
    stale_timeout: Duration,
) -> Result<IdempotencyCheck> {
    let op = key.operation().as_str();
    let candidate = LockEntry::new_in_progress(key, fingerprint.clone());

    let (mut existing, mut version) = match store.claim(key, &candidate).await? {
        ClaimResult::Claimed { version } => {
            return Ok(IdempotencyCheck::Proceed {
                entry: candidate,
                version,
                reclaimed: false,
            });
        }
        ClaimResult::Exists { entry, version } => (*entry, version),
    };

    for _ in 0..MAX_RESOLUTION_ROUNDS {
        // Our own claim landed even though the store reported a failure first.
        if existing.owner_id == candidate.owner_id && existing.state == EntryState::InProgress {
            return Ok(IdempotencyCheck::Proceed {
                entry: existing,
                version,
                reclaimed: false,
            });
        }

        match existing.state {
            EntryState::Completed => return replay_or_conflict(key, &existing, fingerprint),
            EntryState::InProgress if !existing.is_stale(stale_timeout) => {
                return Ok(IdempotencyCheck::InProgress {
                    started_at: existing.created_at,
                });
            }
            EntryState::InProgress => {
                tracing::warn!(
                    key_hash = key.key_hash(),
                    operation = op,
                    started_at = %existing.created_at,
                    attempt = existing.attempt,
                    same_payload = existing.fingerprint_matches(fingerprint),
                    "Reclaiming stale in-progress idempotency entry"
                );
            }
            EntryState::Failed => {
                tracing::debug!(
                    key_hash = key.key_hash(),
                    operation = op,
                    "Replacing failed idempotency entry"
                );
            }
        }

        match store.takeover(key, &existing, fingerprint, &version).await? {
            TakeoverResult::Success {
                entry,
                version: new_version,
            } => {
                record_idempotency_reclaim(op, "success");
                return Ok(IdempotencyCheck::Proceed {
                    entry,
                    version: new_version,
                    reclaimed: true,
                });
            }
            TakeoverResult::RaceDetected {
                current_entry,
                current_version,
            } => {
                record_idempotency_reclaim(op, "race_detected");
                existing = *current_entry;
                version = current_version;
            }
            TakeoverResult::Vanished => {
                record_idempotency_reclaim(op, "vanished");
                match store.claim(key, &candidate).await? {
                    ClaimResult::Claimed { version } => {
                        return Ok(IdempotencyCheck::Proceed {
                            entry: candidate,
                            version,
                            reclaimed: false,
                        });
                    }
                    ClaimResult::Exists {
                        entry,
                        version: current_version,
                    } => {
                        existing = *entry;
                        version = current_version;
                    }
                }
            }
        }
    }

    tracing::warn!(
        key_hash = key.key_hash(),
        operation = op,
        rounds = MAX_RESOLUTION_ROUNDS,
        "Giving up on contended idempotency key"
    );
    Err(IdempotencyError::Contention {
        rounds: MAX_RESOLUTION_ROUNDS,
    })
}

fn replay_or_conflict(
    key: &IdempotencyKey,
    existing: &LockEntry,
    fingerprint: &RequestFingerprint,
) -> Result<IdempotencyCheck> {
    if !existing.fingerprint_matches(fingerprint) {
        tracing::info!(
            key_hash = key.key_hash(),
            operation = %key.operation(),
            "Idempotency key reused with a different request payload"
        );
        return Ok(IdempotencyCheck::Conflict);
    }

    match (existing.result_status, &existing.result_payload) {
        (Some(status), Some(payload)) => Ok(IdempotencyCheck::Replay {
            status,
            payload: payload.clone(),
        }),
        _ => Err(IdempotencyError::InvariantViolation {
            message: "completed entry missing stored reply".to_string(),
        }),
    }
}

/// Reply produced by a unit of work, stored for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Transport status code.
    pub status: u16,
    /// Serialized response body.
    pub payload: Bytes,
}

impl Reply {
    /// Creates a reply.
    #[must_use]
    pub fn new(status: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            status,
            payload: payload.into(),
        }
    }
}

/// How an [`Execution`] was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The work ran under this call.
    Executed,
    /// The stored reply of an earlier call was returned; the work did not run.
    Replayed,
    /// No token was supplied; the work ran without a guard.
    Unguarded,
}

/// Successful result of [`IdempotencyCoordinator::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    /// Status code to return.
    pub status: u16,
    /// Payload to return.
    pub payload: Bytes,
    /// How the reply was produced.
    pub disposition: Disposition,
}

impl Execution {
    fn new(reply: Reply, disposition: Disposition) -> Self {
        Self {
            status: reply.status,
            payload: reply.payload,
            disposition,
        }
    }

    /// Returns true if this is a replay of an earlier call.
    #[must_use]
    pub fn is_replay(&self) -> bool {
        self.disposition == Disposition::Replayed
    }
}

/// Guards keyed writes so their side effects happen at most once.
///
/// Stateless apart from its store handle; clone freely.
#[derive(Clone)]
pub struct IdempotencyCoordinator {
    store: Arc<dyn IdempotencyStore>,
    config: CoordinatorConfig,
}

impl std::fmt::Debug for IdempotencyCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl IdempotencyCoordinator {
    /// Creates a coordinator over an entry store.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is inconsistent.
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        config: CoordinatorConfig,
    ) -> oncewrite_core::Result<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// Creates a coordinator over a key store.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is inconsistent.
    pub fn with_key_store<S: KeyStore + ?Sized>(
        key_store: Arc<S>,
        config: CoordinatorConfig,
    ) -> oncewrite_core::Result<Self> {
        let store = Arc::new(KeyStoreIdempotencyStore::new(key_store, &config));
        Self::new(store, config)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Returns the entry store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn IdempotencyStore> {
        &self.store
    }

    /// Resolves a key without running anything. See [`check_idempotency`].
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable or the key stays contended.
    pub async fn check(
        &self,
        key: &IdempotencyKey,
        fingerprint: &RequestFingerprint,
    ) -> Result<IdempotencyCheck> {
        check_idempotency(self.store.as_ref(), key, fingerprint, self.config.stale_timeout).await
    }

    /// Runs `work` at most once per `(identity, operation, token)`.
    ///
    /// Without a token the work always runs. With a token, the first call runs the work
    /// and stores its reply; later calls with the same payload get the stored reply,
    /// calls with a different payload get [`ExecuteError::FingerprintMismatch`], and
    /// calls while the first is still running get [`ExecuteError::InProgress`].
    ///
    /// The work runs on its own task. If the caller is dropped mid-flight, the work
    /// still completes and its reply is still stored.
    ///
    /// # Errors
    ///
    /// See [`ExecuteError`]. Store failures are returned without running the work.
    pub async fn execute<F, Fut, E>(
        &self,
        identity: &str,
        operation: &Operation,
        token: Option<&str>,
        fingerprint: RequestFingerprint,
        work: F,
    ) -> std::result::Result<Execution, ExecuteError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<Reply, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let Some(token) = token else {
            record_idempotency_check(operation.as_str(), "no_key");
            let started = Instant::now();
            let outcome = work().await;
            record_work_duration(
                operation.as_str(),
                if outcome.is_ok() { "success" } else { "failure" },
                started.elapsed().as_secs_f64(),
            );
            return outcome
                .map(|reply| Execution::new(reply, Disposition::Unguarded))
                .map_err(ExecuteError::Work);
        };

        let key = IdempotencyKey::new(identity, operation.clone(), token)
            .map_err(IdempotencyError::from)?;

        match self.check(&key, &fingerprint).await? {
            IdempotencyCheck::Replay { status, payload } => {
                tracing::debug!(
                    key_hash = key.key_hash(),
                    operation = %operation,
                    status,
                    "Replaying stored reply"
                );
                Ok(Execution::new(Reply { status, payload }, Disposition::Replayed))
            }
            IdempotencyCheck::Conflict => Err(ExecuteError::FingerprintMismatch),
            IdempotencyCheck::InProgress { started_at } => Err(ExecuteError::InProgress {
                started_at,
                retry_after_secs: calculate_retry_after(started_at, self.config.stale_timeout),
            }),
            IdempotencyCheck::Proceed { entry, version, .. } => {
                self.run_owned(key, entry, version, work).await
            }
        }
    }

    async fn run_owned<F, Fut, E>(
        &self,
        key: IdempotencyKey,
        entry: LockEntry,
        version: EntryVersion,
        work: F,
    ) -> std::result::Result<Execution, ExecuteError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<Reply, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let task = OwnedWork {
            store: Arc::clone(&self.store),
            key: key.clone(),
            entry,
            version: version.clone(),
            retain_failures: !self.config.failed_retention.is_zero(),
        };

        match tokio::spawn(task.run(work)).await {
            Ok(result) => result.map(|reply| Execution::new(reply, Disposition::Executed)),
            Err(join_error) => Err(self.settle_join_failure(&key, &version, &join_error).await),
        }
    }

    async fn settle_join_failure<E>(
        &self,
        key: &IdempotencyKey,
        version: &EntryVersion,
        join_error: &JoinError,
    ) -> ExecuteError<E> {
        if !join_error.is_panic() {
            tracing::warn!(
                key_hash = key.key_hash(),
                operation = %key.operation(),
                error = %join_error,
                "Guarded work cancelled, leaving idempotency entry to go stale"
            );
            record_work_duration(key.operation().as_str(), "cancelled", 0.0);
            return ExecuteError::WorkCancelled;
        }

        tracing::error!(
            key_hash = key.key_hash(),
            operation = %key.operation(),
            error = %join_error,
            "Guarded work panicked, releasing idempotency entry"
        );
        record_work_duration(key.operation().as_str(), "panic", 0.0);
        if let Err(e) = self.store.release(key, version).await {
            tracing::warn!(
                key_hash = key.key_hash(),
                error = %e,
                "Failed to release idempotency entry after panic; it will go stale"
            );
        }
        ExecuteError::WorkPanicked
    }
}

/// Work plus everything needed to settle its entry, moved onto a spawned task.
struct OwnedWork {
    store: Arc<dyn IdempotencyStore>,
    key: IdempotencyKey,
    entry: LockEntry,
    version: EntryVersion,
    retain_failures: bool,
}

impl OwnedWork {
    async fn run<F, Fut, E>(self, work: F) -> std::result::Result<Reply, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Reply, E>>,
        E: std::fmt::Display,
    {
        let op = self.key.operation().as_str().to_string();
        let started = Instant::now();
        let outcome = work().await;
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(reply) => {
                record_work_duration(&op, "success", elapsed);
                self.complete(&reply).await;
                Ok(reply)
            }
            Err(e) => {
                record_work_duration(&op, "failure", elapsed);
                self.abandon(&e.to_string()).await;
                Err(ExecuteError::Work(e))
            }
        }
    }

    // The side effect already happened, so the reply is returned even if it cannot be
    // recorded. Later retries then either reclaim the stale entry or see it expire.
    async fn complete(self, reply: &Reply) {
        let completed = match self.entry.complete(reply.status, reply.payload.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(key_hash = self.key.key_hash(), error = %e, "Cannot complete entry");
                return;
            }
        };

        match self.store.finalize(&self.key, &completed, &self.version).await {
            Ok(FinalizeResult::Success { .. }) => {}
            Ok(FinalizeResult::Conflict { current_version }) => {
                tracing::warn!(
                    key_hash = self.key.key_hash(),
                    operation = %self.key.operation(),
                    attempt = completed.attempt,
                    entry_gone = current_version.is_none(),
                    "Idempotency entry changed before completion was recorded"
                );
            }
            Err(e) => {
                tracing::error!(
                    key_hash = self.key.key_hash(),
                    operation = %self.key.operation(),
                    error = %e,
                    "Failed to record completed reply"
                );
            }
        }
    }

    async fn abandon(self, message: &str) {
        let key_hash = self.key.key_hash().to_string();

        let result = if self.retain_failures {
            match self.entry.fail(message) {
                Ok(failed) => self
                    .store
                    .finalize(&self.key, &failed, &self.version)
                    .await
                    .map(|r| matches!(r, FinalizeResult::Success { .. })),
                Err(e) => Err(e),
            }
        } else {
            self.store.release(&self.key, &self.version).await
        };

        match result {
            Ok(true) => {
                tracing::debug!(key_hash = %key_hash, "Released idempotency entry after work failure");
            }
            Ok(false) => {
                tracing::warn!(
                    key_hash = %key_hash,
                    "Idempotency entry changed before it could be released"
                );
            }
            Err(e) => {
                tracing::warn!(
                    key_hash = %key_hash,
                    error = %e,
                    "Failed to release idempotency entry; it will go stale"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use oncewrite_core::MemoryKeyStore;

    use super::*;

    fn key(token: &str) -> IdempotencyKey {
        IdempotencyKey::new(
            "user-1",
            Operation::new("create_post").expect("operation"),
            token,
        )
        .expect("key")
    }

    fn fp(s: &str) -> RequestFingerprint {
        RequestFingerprint::new(s)
    }

    fn store() -> KeyStoreIdempotencyStore<MemoryKeyStore> {
        KeyStoreIdempotencyStore::new(
            Arc::new(MemoryKeyStore::new()),
            &CoordinatorConfig::default(),
        )
    }

    const STALE: Duration = Duration::from_secs(300);

    async fn complete(store: &dyn IdempotencyStore, key: &IdempotencyKey, hash: &str) {
        let IdempotencyCheck::Proceed { entry, version, .. } =
            check_idempotency(store, key, &fp(hash), STALE).await.expect("check")
        else {
            panic!("expected proceed");
        };
        let completed = entry.complete(201, Bytes::from_static(b"p1")).expect("complete");
        store.finalize(key, &completed, &version).await.expect("finalize");
    }

    #[tokio::test]
    async fn test_check_new_request_proceeds() {
        let store = store();
        let result = check_idempotency(&store, &key("a"), &fp("h"), STALE).await.expect("check");
        assert!(matches!(result, IdempotencyCheck::Proceed { reclaimed: false, .. }));
    }

    #[tokio::test]
    async fn test_check_replay() {
        let store = store();
        let key = key("a");
        complete(&store, &key, "h").await;

        let result = check_idempotency(&store, &key, &fp("h"), STALE).await.expect("check");
        match result {
            IdempotencyCheck::Replay { status, payload } => {
                assert_eq!(status, 201);
                assert_eq!(payload, Bytes::from_static(b"p1"));
            }
            other => panic!("expected Replay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_check_completed_mismatch_conflicts() {
        let store = store();
        let key = key("a");
        complete(&store, &key, "h1").await;

        let result = check_idempotency(&store, &key, &fp("h2"), STALE).await.expect("check");
        assert!(matches!(result, IdempotencyCheck::Conflict));
    }

    #[tokio::test]
    async fn test_check_fresh_in_progress() {
        let store = store();
        let key = key("a");
        check_idempotency(&store, &key, &fp("h"), STALE).await.expect("first");

        // A different payload still sees the running attempt first
        for hash in ["h", "other"] {
            let result = check_idempotency(&store, &key, &fp(hash), STALE).await.expect("check");
            assert!(
                matches!(result, IdempotencyCheck::InProgress { .. }),
                "fresh in-progress entry should not be taken over, got {result:?}"
            );
        }
    }

    async fn seed_stale(store: &dyn IdempotencyStore, key: &IdempotencyKey, hash: &str) -> LockEntry {
        let mut stale = LockEntry::new_in_progress(key, fp(hash));
        stale.created_at = Utc::now() - chrono::Duration::minutes(10);
        let result = store.claim(key, &stale).await.expect("claim");
        assert!(matches!(result, ClaimResult::Claimed { .. }));
        stale
    }

    #[tokio::test]
    async fn test_check_stale_reclaimed() {
        let store = store();
        let key = key("a");
        let stale = seed_stale(&store, &key, "h").await;

        let result = check_idempotency(&store, &key, &fp("h"), STALE).await.expect("check");
        let IdempotencyCheck::Proceed { entry, reclaimed, .. } = result else {
            panic!("stale entry should allow reclamation, got {result:?}");
        };
        assert!(reclaimed);
        assert_eq!(entry.attempt, 2);
        assert_ne!(entry.owner_id, stale.owner_id);
    }

    #[tokio::test]
    async fn test_check_stale_with_new_payload_reclaimed() {
        let store = store();
        let key = key("a");
        seed_stale(&store, &key, "h1").await;

        let result = check_idempotency(&store, &key, &fp("h2"), STALE).await.expect("check");
        let IdempotencyCheck::Proceed { entry, reclaimed, .. } = result else {
            panic!("stale entry should be reclaimed for any payload, got {result:?}");
        };
        assert!(reclaimed);
        assert_eq!(entry.request_fingerprint, fp("h2"));
    }

    #[tokio::test]
    async fn test_check_failed_entry_treated_as_absent() {
        let config = CoordinatorConfig {
            failed_retention: Duration::from_secs(60),
            ..CoordinatorConfig::default()
        };
        let store = KeyStoreIdempotencyStore::new(Arc::new(MemoryKeyStore::new()), &config);
        let key = key("a");

        let IdempotencyCheck::Proceed { entry, version, .. } =
            check_idempotency(&store, &key, &fp("h1"), STALE).await.expect("check")
        else {
            panic!("expected proceed");
        };
        let failed = entry.fail("boom").expect("fail");
        store.finalize(&key, &failed, &version).await.expect("finalize");

        // Any payload may reuse the key after a failure
        let result = check_idempotency(&store, &key, &fp("h2"), STALE).await.expect("check");
        let IdempotencyCheck::Proceed { entry, reclaimed, .. } = result else {
            panic!("failed entry should be replaced, got {result:?}");
        };
        assert!(reclaimed);
        assert_eq!(entry.request_fingerprint, fp("h2"));
    }

    #[test]
    fn test_calculate_retry_after_bounds() {
        let retry = calculate_retry_after(Utc::now(), STALE);
        assert!((1..=300).contains(&retry), "fresh entry retry={retry}");

        let old_start = Utc::now() - chrono::Duration::minutes(10);
        assert_eq!(calculate_retry_after(old_start, STALE), 1);
    }

    #[test]
    fn test_calculate_retry_after_jitter_range() {
        let stale_timeout = Duration::from_secs(100);
        let started_at = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);

        let now_min_jitter = DateTime::parse_from_rfc3339("2025-01-01T00:00:00.000000000Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        let retry_min = calculate_retry_after_at(now_min_jitter, started_at, stale_timeout);
        assert_eq!(retry_min, 100, "0 nanos -> factor 1.0 -> 100s");

        let now_max_jitter = DateTime::parse_from_rfc3339("2025-01-01T00:00:00.999999999Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        let retry_max = calculate_retry_after_at(now_max_jitter, started_at, stale_timeout);
        assert!(
            (118..=120).contains(&retry_max),
            "999M nanos -> factor ~1.2 -> ~120s, got {retry_max}"
        );
    }

    #[test]
    fn test_retry_after_caps_long_timeouts() {
        let retry = calculate_retry_after(Utc::now(), Duration::from_secs(3600));
        assert_eq!(retry, 300);
    }

    #[tokio::test]
    async fn test_execute_without_token_is_unguarded() {
        let coordinator = IdempotencyCoordinator::with_key_store(
            Arc::new(MemoryKeyStore::new()),
            CoordinatorConfig::default(),
        )
        .expect("coordinator");
        let operation = Operation::new("create_post").expect("operation");

        for _ in 0..2 {
            let execution = coordinator
                .execute("user-1", &operation, None, fp("h"), || async {
                    Ok::<_, String>(Reply::new(201, "p"))
                })
                .await
                .expect("execute");
            assert_eq!(execution.disposition, Disposition::Unguarded);
        }
    }

    #[tokio::test]
    async fn test_execute_invalid_token_rejected() {
        let coordinator = IdempotencyCoordinator::with_key_store(
            Arc::new(MemoryKeyStore::new()),
            CoordinatorConfig::default(),
        )
        .expect("coordinator");
        let operation = Operation::new("create_post").expect("operation");

        let result = coordinator
            .execute("user-1", &operation, Some("has space"), fp("h"), || async {
                Ok::<_, String>(Reply::new(201, "p"))
            })
            .await;
        assert!(matches!(
            result,
            Err(ExecuteError::Idempotency(IdempotencyError::InvalidKey(_)))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_work_leaves_entry_in_progress() {
        let coordinator = IdempotencyCoordinator::with_key_store(
            Arc::new(MemoryKeyStore::new()),
            CoordinatorConfig::default(),
        )
        .expect("coordinator");
        let key = key("a");
        let IdempotencyCheck::Proceed { version, .. } =
            coordinator.check(&key, &fp("h")).await.expect("check")
        else {
            panic!("expected proceed");
        };

        let handle = tokio::spawn(std::future::pending::<()>());
        handle.abort();
        let join_error = handle.await.expect_err("aborted task");
        assert!(join_error.is_cancelled());

        let error: ExecuteError<String> =
            coordinator.settle_join_failure(&key, &version, &join_error).await;
        assert!(matches!(error, ExecuteError::WorkCancelled));

        let (entry, _) = coordinator.store().load(&key).await.expect("load").expect("entry");
        assert_eq!(entry.state, EntryState::InProgress);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CoordinatorConfig {
            stale_timeout: Duration::ZERO,
            ..CoordinatorConfig::default()
        };
        assert!(IdempotencyCoordinator::with_key_store(Arc::new(MemoryKeyStore::new()), config).is_err());
    }
}
