//! Request fingerprints.
//!
//! A fingerprint is the SHA-256 of the semantically relevant request body. JSON bodies are
//! hashed in RFC 8785 (JCS) canonical form so that key order and whitespace do not turn a
//! genuine retry into a conflict.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Error canonicalizing a JSON request body for fingerprinting.
#[derive(Debug, thiserror::Error)]
pub enum CanonicalizationError {
    /// Failed to canonicalize JSON per RFC 8785.
    #[error("failed to canonicalize JSON: {0}")]
    Canonicalize(#[from] serde_json::Error),
}

/// Hex SHA-256 fingerprint of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    /// Wraps a fingerprint computed by the caller.
    #[must_use]
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Fingerprints a JSON value by its canonical form.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be canonicalized (e.g. non-finite numbers).
    pub fn from_json(value: &serde_json::Value) -> Result<Self, CanonicalizationError> {
        Self::from_serialize(value)
    }

    /// Fingerprints any serializable request by its canonical JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be canonicalized.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, CanonicalizationError> {
        let canonical = serde_jcs::to_string(value)?;
        Ok(Self::from_bytes(canonical.as_bytes()))
    }

    /// Fingerprints raw bytes (for non-JSON bodies).
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    /// Returns the fingerprint as a hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
