//! Provably-Fair Randomness
//!
//! Commit/reveal lifecycle for the seed that fixes each round's crash point.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    PROVABLY FAIR                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  seed.rs    - SeedManager: commit, rotate, reveal, audit    │
//! │  crash.rs   - HMAC-SHA256 crash point derivation            │
//! │  clock.rs   - Elapsed time -> displayed multiplier          │
//! │  verify.rs  - Client-side verification of revealed rounds   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod clock;
pub mod crash;
pub mod seed;
pub mod verify;

// Re-export key types
pub use clock::MultiplierClock;
pub use crash::{derive, CrashConfig};
pub use seed::{AuditRecord, SeedCommitment, SeedError, SeedManager, ServerSeed};
pub use verify::{verify_against_commitment, verify_chain, verify_reveal, VerifyError};
