//! Crash Point Derivation
//!
//! Pure function from committed seed material to the round's crash multiplier.
//! Anyone holding a revealed audit record can re-run it and must get the same
//! value bit for bit, so every step is integer arithmetic.
//!
//! ## Formula
//!
//! ```text
//! digest = HMAC-SHA256(key = server_seed, msg = client_seed ":" nonce)
//! h      = first 52 bits of digest (big-endian)      h ∈ [0, 2^52)
//! crash  = floor((10000 - edge_bps) * 2^52 / (100 * (2^52 - h)))
//! crash  = clamp(crash, 100, max_multiplier)          (hundredths)
//! ```
//!
//! For any cash-out target of 1.01x or more the expected return is
//! `1 - edge_bps / 10000`. Outcomes that fall below 1.00x collapse onto the
//! instant crash at 1.00x.

use serde::{Deserialize, Serialize};

use crate::core::amount::{Multiplier, MULTIPLIER_ONE};
use crate::core::hash::hmac_sha256;

/// Bits of the digest used as the uniform sample.
pub const SAMPLE_BITS: u32 = 52;

/// Basis-point denominator.
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Default multiplier cap: 10,000x.
pub const DEFAULT_MAX_MULTIPLIER: Multiplier = 1_000_000;

/// Parameters of the house-edge mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashConfig {
    /// House edge in basis points (100 = 1%). Must be below 10000.
    pub house_edge_bps: u32,
    /// Highest crash point a round may reach (hundredths).
    pub max_multiplier: Multiplier,
}

impl Default for CrashConfig {
    fn default() -> Self {
        Self {
            house_edge_bps: 0,
            max_multiplier: DEFAULT_MAX_MULTIPLIER,
        }
    }
}

impl CrashConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            house_edge_bps: std::env::var("CRASH_HOUSE_EDGE_BPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|bps| (*bps as u64) < BPS_DENOMINATOR)
                .unwrap_or(defaults.house_edge_bps),
            max_multiplier: std::env::var("CRASH_MAX_MULTIPLIER")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|m| *m >= MULTIPLIER_ONE)
                .unwrap_or(defaults.max_multiplier),
        }
    }
}

/// Message fed to the HMAC: `client_seed ":" nonce`.
pub fn derivation_message(client_seed: &str, nonce: u64) -> Vec<u8> {
    format!("{}:{}", client_seed, nonce).into_bytes()
}

/// Uniform sample in `[0, 2^52)` for the given inputs.
pub fn sample(server_seed: &[u8], client_seed: &str, nonce: u64) -> u64 {
    let digest = hmac_sha256(server_seed, &derivation_message(client_seed, nonce));
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) >> (64 - SAMPLE_BITS)
}

/// Map a uniform sample onto a crash multiplier.
///
/// Monotonic non-decreasing in `h`. Total for every `h` and config.
pub fn multiplier_from_sample(h: u64, config: &CrashConfig) -> Multiplier {
    let e: u128 = 1u128 << SAMPLE_BITS;
    let h = (h as u128).min(e - 1);
    let edge = (config.house_edge_bps as u128).min(BPS_DENOMINATOR as u128 - 1);
    let max = config.max_multiplier.max(MULTIPLIER_ONE);

    let numerator = (BPS_DENOMINATOR as u128 - edge) * e;
    let denominator = 100 * (e - h);
    let raw = numerator / denominator;

    (raw.min(max as u128) as Multiplier).max(MULTIPLIER_ONE)
}

/// Derive the crash point for a round.
///
/// # Example
///
/// ```
/// use crash_wager::fair::crash::{derive, CrashConfig};
///
/// let config = CrashConfig::default();
/// let a = derive(&[7u8; 32], "public-seed", 42, &config);
/// let b = derive(&[7u8; 32], "public-seed", 42, &config);
/// assert_eq!(a, b);
/// assert!(a >= 100);
/// ```
pub fn derive(server_seed: &[u8], client_seed: &str, nonce: u64, config: &CrashConfig) -> Multiplier {
    multiplier_from_sample(sample(server_seed, client_seed, nonce), config)
}

// =============================================================================
// TESTS
// =============================================================================
