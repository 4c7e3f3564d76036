//! Composite idempotency keys.
//!
//! A key is the triple `(identity, operation, token)`. Two callers that happen to pick
//! the same token never collide, and neither do two operations of the same caller.
//!
//! ## Storage Layout
//!
//! ```text
//! {prefix}/{operation}/{key_hash_prefix}/{key_hash}
//! ```
//!
//! Where:
//! - `operation`: validated operation name such as `create_post`
//! - `key_hash`: hex `SHA256(len(identity) || identity || token)`
//! - `key_hash_prefix`: first 2 characters of `key_hash`
//!
//! The raw token never appears in the storage key.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

/// Maximum token length in bytes.
pub const MAX_TOKEN_LEN: usize = 255;

/// Maximum operation name length.
pub const MAX_OPERATION_LEN: usize = 64;

/// Error validating the parts of an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdempotencyKeyError {
    /// Token is empty.
    #[error("idempotency key must not be empty")]
    EmptyToken,

    /// Token is longer than [`MAX_TOKEN_LEN`].
    #[error("idempotency key must be at most {max} bytes, got {len}")]
    TokenTooLong {
        /// Length of the rejected token.
        len: usize,
        /// Maximum permitted length.
        max: usize,
    },

    /// Token contains whitespace, control or non-ASCII characters.
    #[error("idempotency key must contain only visible ASCII characters")]
    InvalidTokenCharacter,

    /// Caller identity is empty.
    #[error("caller identity must not be empty")]
    EmptyIdentity,

    /// Operation name is not `[a-z0-9_]{1,64}`.
    #[error("invalid operation name {name:?}: expected 1-64 lowercase letters, digits or '_'")]
    InvalidOperation {
        /// The rejected name.
        name: String,
    },
}

/// Validated name of a guarded logical endpoint (e.g. `create_post`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Operation(String);

impl Operation {
    /// Validates and wraps an operation name.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyKeyError::InvalidOperation`] unless the name is 1 to 64
    /// lowercase ASCII letters, digits or underscores.
    pub fn new(name: impl Into<String>) -> Result<Self, IdempotencyKeyError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= MAX_OPERATION_LEN
            && name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
        if valid {
            Ok(Self(name))
        } else {
            Err(IdempotencyKeyError::InvalidOperation { name })
        }
    }

    /// Returns the operation as a path segment.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Operation {
    type Err = IdempotencyKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Validates a client-supplied token.
///
/// # Errors
///
/// Returns an error if the token is empty, longer than [`MAX_TOKEN_LEN`] bytes, or
/// contains anything other than visible ASCII (`0x21..=0x7E`).
pub fn validate_token(token: &str) -> Result<(), IdempotencyKeyError> {
    if token.is_empty() {
        return Err(IdempotencyKeyError::EmptyToken);
    }
    if token.len() > MAX_TOKEN_LEN {
        return Err(IdempotencyKeyError::TokenTooLong {
            len: token.len(),
            max: MAX_TOKEN_LEN,
        });
    }
    if !token.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(IdempotencyKeyError::InvalidTokenCharacter);
    }
    Ok(())
}

/// Composite idempotency key: `(identity, operation, token)`.
#[derive(Clone, PartialEq, Eq)]
pub struct IdempotencyKey {
    identity: String,
    operation: Operation,
    token: String,
    hash: String,
}

impl IdempotencyKey {
    /// Builds a key after validating identity and token.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity is empty or the token is invalid.
    pub fn new(
        identity: impl Into<String>,
        operation: Operation,
        token: impl Into<String>,
    ) -> Result<Self, IdempotencyKeyError> {
        let identity = identity.into();
        let token = token.into();

        if identity.is_empty() {
            return Err(IdempotencyKeyError::EmptyIdentity);
        }
        validate_token(&token)?;

        let hash = Self::hash_parts(&identity, &token);
        Ok(Self {
            identity,
            operation,
            token,
            hash,
        })
    }

    /// Computes the key hash of an identity/token pair.
    ///
    /// The identity is length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
    #[must_use]
    pub fn hash_parts(identity: &str, token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update((identity.len() as u64).to_be_bytes());
        hasher.update(identity.as_bytes());
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Caller identity.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Guarded operation.
    #[must_use]
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Client-supplied token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Hex SHA-256 of identity and token. Safe to log.
    #[must_use]
    pub fn key_hash(&self) -> &str {
        &self.hash
    }

    /// Returns the storage key under `prefix`.
    #[must_use]
    pub fn storage_key(&self, prefix: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            prefix.trim_end_matches('/'),
            self.operation,
            &self.hash[..2],
            self.hash
        )
    }
}

// Tokens are bearer-ish secrets for the duration of a retry window; keep them out of logs.
impl fmt::Debug for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyKey")
            .field("identity", &self.identity)
            .field("operation", &self.operation.as_str())
            .field("key_hash", &self.hash)
            .finish_non_exhaustive()
    }
}
