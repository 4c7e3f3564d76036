//! Error types and result aliases for oncewrite.
//!
//! Errors are structured for programmatic handling: callers decide whether to retry by
//! asking [`Error::is_retryable`] instead of matching on messages.

/// The result type used throughout oncewrite.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in key store and shared operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backing store could not be reached or rejected the operation transiently.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A key or object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true for connectivity failures that may succeed when repeated.
    ///
    /// Only storage errors qualify; malformed data and invalid input never heal on retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}
