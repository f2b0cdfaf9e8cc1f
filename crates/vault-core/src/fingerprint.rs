//! Content fingerprints.
//!
//! A fingerprint is the SHA-256 of a document's bytes, rendered as lowercase hex.
//! The cache uses it to skip unchanged writes and the version store records it on
//! both sides of every revision. It is a change detector, not an integrity check.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex length of a SHA-256 digest.
pub const FINGERPRINT_LEN: usize = 64;

/// A content digest representing one exact document state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of raw bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    /// Compute the fingerprint of text content.
    pub fn of(content: &str) -> Self {
        Self::of_bytes(content.as_bytes())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
