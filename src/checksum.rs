//! Content hashes for handler versions and schema snapshots

use sha2::{Digest, Sha256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SHA256 hash identifying the content of a handler version or schema
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash raw bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(format!("{:x}", hash))
    }

    /// Hash a string (e.g. handler source text)
    pub fn of_str(content: &str) -> Self {
        Self::from_bytes(content.as_bytes())
    }

    /// Hash a JSON value in its serialized form.
    ///
    /// Key order is significant: two schemas that differ only in field order
    /// hash differently, and the diff engine reports the reordering.
    pub fn from_json(value: &serde_json::Value) -> Self {
        // Serializing a Value cannot fail: every key is a string.
        let canonical = serde_json::to_string(value).unwrap_or_default();
        Self::of_str(&canonical)
    }

    /// Get the hex string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }

    /// Verify that content matches this hash
    pub fn verify(&self, content: &str) -> bool {
        Self::of_str(content) == *self
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ContentHash {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ContentHash {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
