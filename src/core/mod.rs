//! Core primitives.
//!
//! Integer money, digests and entropy. Nothing in this module touches the
//! network or the clock.

pub mod amount;
pub mod entropy;
pub mod hash;

// Re-export core types
pub use amount::{Amount, Multiplier, AMOUNT_ONE, MULTIPLIER_ONE};
pub use entropy::{EntropyError, EntropySource, OsEntropy};
pub use hash::{Digest32, RecordHasher};
