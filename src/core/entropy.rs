//! Server Seed Entropy
//!
//! Server seeds come from the operating system CSPRNG. There is no fallback
//! source: if the OS cannot provide randomness, seed commitment fails and no
//! round may start.

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Length of a server seed in bytes (256 bits).
pub const SEED_LEN: usize = 32;

/// Entropy source failure.
#[derive(Debug, Clone, Error)]
#[error("entropy source failed: {0}")]
pub struct EntropyError(pub String);

/// Source of server seed bytes.
pub trait EntropySource: Send + Sync {
    /// Fill a fresh 32-byte seed.
    fn fill_seed(&self) -> Result<[u8; SEED_LEN], EntropyError>;
}

/// Operating system CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill_seed(&self) -> Result<[u8; SEED_LEN], EntropyError> {
        let mut seed = [0u8; SEED_LEN];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| EntropyError(e.to_string()))?;
        Ok(seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_entropy_produces_distinct_seeds() {
        let a = OsEntropy.fill_seed().unwrap();
        let b = OsEntropy.fill_seed().unwrap();
        assert_ne!(a, b);
        assert_ne!(a, [0u8; SEED_LEN]);
    }
}
