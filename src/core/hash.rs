//! Hashing for Commitments and Audit Records
//!
//! Provides the digests everything public is built from:
//! - Server seed commitments (plain SHA-256, recomputable by anyone)
//! - HMAC-SHA256 for crash point derivation
//! - Domain-separated hashing for the audit record chain

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

/// Hash output type (256 bits / 32 bytes)
pub type Digest32 = [u8; 32];

type HmacSha256 = Hmac<Sha256>;

/// Incremental hasher with a domain separator.
///
/// Order of updates is part of the format.
pub struct RecordHasher {
    hasher: Sha256,
}

impl RecordHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for seed audit records.
    pub fn for_audit_record() -> Self {
        Self::new(b"CRASH_WAGER_AUDIT_V1")
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a length-prefixed string.
    #[inline]
    pub fn update_str(&mut self, value: &str) {
        self.update_u64(value.len() as u64);
        self.hasher.update(value.as_bytes());
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> Digest32 {
        self.hasher.finalize().into()
    }
}

/// Plain SHA-256 of arbitrary data.
pub fn sha256(data: &[u8]) -> Digest32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// HMAC-SHA256 of `message` under `key`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> Digest32 {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts any key length"),
    };
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Decode a 64-character hex string into a 32-byte digest.
pub fn digest_from_hex(s: &str) -> Option<Digest32> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

/// Serde adapter writing 32-byte values as lowercase hex strings.
pub mod hex_digest {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use super::{digest_from_hex, Digest32};

    /// Serialize as hex.
    pub fn serialize<S: Serializer>(value: &Digest32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    /// Deserialize from hex.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Digest32, D::Error> {
        let s = String::deserialize(deserializer)?;
        digest_from_hex(&s).ok_or_else(|| D::Error::custom("expected 64 hex characters"))
    }
}

// =============================================================================
// TESTS
// =============================================================================
