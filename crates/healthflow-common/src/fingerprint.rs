//! Content fingerprints for aggregate deduplication
//!
//! A fingerprint is the SHA-256 digest of the exact serialized payload bytes,
//! rendered as 64 lowercase hex characters. Computing one is pure: the same
//! bytes always produce the same fingerprint.

use crate::error::{HealthflowError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest
pub const FINGERPRINT_HEX_LEN: usize = 64;

/// SHA-256 digest of a serialized aggregate payload
///
/// Serializes as a plain string. Deserializing goes through [`Fingerprint::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint an in-memory payload
    pub fn of(payload: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(payload)))
    }

    /// Parse a stored fingerprint, accepting upper or lower case hex
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.len() != FINGERPRINT_HEX_LEN || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HealthflowError::InvalidFingerprint(value.to_string()));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether `payload` hashes to this fingerprint
    pub fn matches(&self, payload: &[u8]) -> bool {
        Self::of(payload) == *self
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = HealthflowError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(fingerprint: Fingerprint) -> Self {
        fingerprint.0
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
