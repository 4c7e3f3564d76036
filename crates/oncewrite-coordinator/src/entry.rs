//! Lock entries: the record stored under each composite key.
//!
//! An entry goes through these states:
//! 1. `InProgress` - claimed before the work starts
//! 2. `Completed` - finalized with the reply to replay, immutable until TTL expiry
//! 3. `Failed` - finalized after the work failed (only kept when failure retention is on)
//!
//! A stale `InProgress` entry can be reclaimed, which produces a fresh `InProgress`
//! entry with a new owner and `attempt + 1`.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{IdempotencyError, Result};
use crate::fingerprint::RequestFingerprint;
use crate::key::IdempotencyKey;

/// State of a lock entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryState {
    /// Work is running.
    InProgress,
    /// Work succeeded; the reply is stored for replay.
    Completed,
    /// Work failed. Treated as absent by resolution.
    Failed,
}

impl EntryState {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Record stored under a composite idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    /// Current state.
    pub state: EntryState,

    /// Caller identity.
    pub identity: String,

    /// Operation name.
    pub operation: String,

    /// Client token, kept for diagnostics.
    pub token: String,

    /// Fingerprint of the request that claimed the key.
    pub request_fingerprint: RequestFingerprint,

    /// Execution attempt that owns this entry.
    pub owner_id: Ulid,

    /// 1 on creation, incremented by every reclamation.
    pub attempt: u32,

    /// When the owning attempt claimed the entry.
    pub created_at: DateTime<Utc>,

    /// When the work completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// When the work failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    /// Status code to replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_status: Option<u16>,

    /// Payload to replay, base64 in the serialized form.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "payload_base64")]
    pub result_payload: Option<Bytes>,

    /// Failure description (only set for `Failed`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl LockEntry {
    /// Creates a fresh in-progress entry owned by a new attempt.
    #[must_use]
    pub fn new_in_progress(key: &IdempotencyKey, fingerprint: RequestFingerprint) -> Self {
        Self {
            state: EntryState::InProgress,
            identity: key.identity().to_string(),
            operation: key.operation().as_str().to_string(),
            token: key.token().to_string(),
            request_fingerprint: fingerprint,
            owner_id: Ulid::new(),
            attempt: 1,
            created_at: Utc::now(),
            completed_at: None,
            failed_at: None,
            result_status: None,
            result_payload: None,
            failure_message: None,
        }
    }

    /// Transitions `InProgress -> Completed` with the reply to replay.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::InvariantViolation`] if the entry is not in progress.
    pub fn complete(mut self, status: u16, payload: Bytes) -> Result<Self> {
        self.ensure_in_progress("complete")?;
        self.state = EntryState::Completed;
        self.completed_at = Some(Utc::now());
        self.result_status = Some(status);
        self.result_payload = Some(payload);
        Ok(self)
    }

    /// Transitions `InProgress -> Failed`.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::InvariantViolation`] if the entry is not in progress.
    pub fn fail(mut self, message: impl Into<String>) -> Result<Self> {
        self.ensure_in_progress("fail")?;
        self.state = EntryState::Failed;
        self.failed_at = Some(Utc::now());
        self.failure_message = Some(message.into());
        Ok(self)
    }

    /// Builds the entry that replaces this one on reclamation.
    ///
    /// The replacement is in progress, owned by a new attempt, and carries the
    /// fingerprint of the reclaiming request.
    #[must_use]
    pub fn reclaimed(&self, fingerprint: RequestFingerprint) -> Self {
        Self {
            state: EntryState::InProgress,
            identity: self.identity.clone(),
            operation: self.operation.clone(),
            token: self.token.clone(),
            request_fingerprint: fingerprint,
            owner_id: Ulid::new(),
            attempt: self.attempt.saturating_add(1),
            created_at: Utc::now(),
            completed_at: None,
            failed_at: None,
            result_status: None,
            result_payload: None,
            failure_message: None,
        }
    }

    /// Returns whether this is an in-progress entry older than `timeout`.
    #[must_use]
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.is_stale_at(Utc::now(), timeout)
    }

    /// Returns whether this is an in-progress entry older than `timeout` at `now`.
    #[must_use]
    pub fn is_stale_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.state == EntryState::InProgress && self.created_at + to_chrono(timeout) < now
    }

    /// Returns whether the entry was claimed with the same request payload.
    #[must_use]
    pub fn fingerprint_matches(&self, fingerprint: &RequestFingerprint) -> bool {
        &self.request_fingerprint == fingerprint
    }

    /// Serializes to the stored JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| IdempotencyError::InvariantViolation {
                message: format!("failed to serialize lock entry: {e}"),
            })
    }

    /// Parses the stored JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::CorruptEntry`] if the bytes are not a lock entry.
    pub fn from_bytes(storage_key: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| IdempotencyError::CorruptEntry {
            key: storage_key.to_string(),
            message: e.to_string(),
        })
    }

    fn ensure_in_progress(&self, transition: &str) -> Result<()> {
        if self.state == EntryState::InProgress {
            Ok(())
        } else {
            Err(IdempotencyError::InvariantViolation {
                message: format!(
                    "cannot {transition} entry in state {} (owner {})",
                    self.state.as_str(),
                    self.owner_id
                ),
            })
        }
    }
}

/// Converts a std duration to chrono, saturating at a century.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

mod payload_base64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Bytes>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| {
                STANDARD
                    .decode(encoded)
                    .map(Bytes::from)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}
