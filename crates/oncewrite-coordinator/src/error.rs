//! Coordinator error types.

use chrono::{DateTime, Utc};

use crate::key::IdempotencyKeyError;

/// Result type for idempotency store and resolution operations.
pub type Result<T> = std::result::Result<T, IdempotencyError>;

/// Errors raised while guarding a write, independent of the work itself.
#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    /// The key (identity, operation or token) failed validation. Client error.
    #[error(transparent)]
    InvalidKey(#[from] IdempotencyKeyError),

    /// The shared key store could not be reached. The write is refused rather than run
    /// unguarded.
    #[error("idempotency store unavailable: {0}")]
    StoreUnavailable(#[source] oncewrite_core::Error),

    /// An entry exists but could not be decoded.
    #[error("corrupt idempotency entry at {key}: {message}")]
    CorruptEntry {
        /// Storage key of the entry.
        key: String,
        /// Decode failure.
        message: String,
    },

    /// Resolution kept losing races and gave up.
    #[error("idempotency key still contended after {rounds} resolution rounds")]
    Contention {
        /// Number of rounds attempted.
        rounds: u32,
    },

    /// An entry was in a state the protocol never produces.
    #[error("idempotency invariant violated: {message}")]
    InvariantViolation {
        /// Description of the violation.
        message: String,
    },
}

impl IdempotencyError {
    /// Returns true if repeating the call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable(e) => e.is_retryable(),
            Self::Contention { .. } => true,
            Self::InvalidKey(_) | Self::CorruptEntry { .. } | Self::InvariantViolation { .. } => {
                false
            }
        }
    }
}

impl From<oncewrite_core::Error> for IdempotencyError {
    fn from(err: oncewrite_core::Error) -> Self {
        Self::StoreUnavailable(err)
    }
}

/// Outcome of [`IdempotencyCoordinator::execute`](crate::IdempotencyCoordinator::execute)
/// when no reply can be returned.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E> {
    /// Another request with the same key is still running.
    #[error("a request with this idempotency key is in progress, retry after {retry_after_secs}s")]
    InProgress {
        /// When the running attempt started.
        started_at: DateTime<Utc>,
        /// Suggested client back-off in seconds.
        retry_after_secs: u64,
    },

    /// The key was already used with a different request payload.
    #[error("idempotency key was already used with a different request payload")]
    FingerprintMismatch,

    /// The work ran and failed. The key was released so a retry can run again.
    #[error("{0}")]
    Work(E),

    /// The work panicked. The key was released.
    #[error("work panicked before completing")]
    WorkPanicked,

    /// The work was cancelled before it finished, typically by runtime shutdown. The
    /// entry is left in progress until it goes stale, since the side effect may have
    /// happened.
    #[error("work was cancelled before completing")]
    WorkCancelled,

    /// The coordinator itself failed.
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
}

impl<E> ExecuteError<E> {
    /// Returns the work error, if this is one.
    pub fn into_work(self) -> Option<E> {
        match self {
            Self::Work(e) => Some(e),
            _ => None,
        }
    }
}
