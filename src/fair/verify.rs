//! Reveal Verification
//!
//! Everything a player needs to check a round after the fact, using only the
//! public audit record: the commitment binds the seed, the crash point is
//! re-derived bit for bit, and the record is linked into the chain.

use crate::core::amount::Multiplier;
use crate::core::hash::Digest32;
use crate::fair::crash::{derive, CrashConfig};
use crate::fair::seed::{AuditRecord, SeedCommitment};

/// Errors that can occur while verifying a reveal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// SHA-256 of the revealed seed differs from the published hash.
    CommitmentMismatch,

    /// Revealed record does not match the commitment seen before betting.
    PublishedHashMismatch {
        /// Nonce of the record.
        nonce: u64,
    },

    /// Re-derived crash point differs from the one used in settlement.
    CrashPointMismatch {
        /// Value recomputed from the seed.
        expected: Multiplier,
        /// Value carried in the record.
        got: Multiplier,
    },

    /// Stored record hash does not match its contents.
    RecordHashMismatch {
        /// Nonce of the record.
        nonce: u64,
    },

    /// Record does not link to its predecessor.
    BrokenChain {
        /// Nonce of the record whose `previous_hash` is wrong.
        nonce: u64,
    },

    /// Nonces are not strictly increasing.
    NonceOrder {
        /// Nonce that appeared out of order.
        nonce: u64,
    },
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CommitmentMismatch => write!(f, "Revealed seed does not hash to the commitment"),
            Self::PublishedHashMismatch { nonce } => {
                write!(f, "Record {} does not match the published commitment", nonce)
            }
            Self::CrashPointMismatch { expected, got } => {
                write!(f, "Crash point mismatch: derived {}, recorded {}", expected, got)
            }
            Self::RecordHashMismatch { nonce } => write!(f, "Record {} hash mismatch", nonce),
            Self::BrokenChain { nonce } => write!(f, "Record {} does not link to its predecessor", nonce),
            Self::NonceOrder { nonce } => write!(f, "Record {} is out of nonce order", nonce),
        }
    }
}

impl std::error::Error for VerifyError {}

/// Verify one revealed record and return the re-derived crash point.
pub fn verify_reveal(record: &AuditRecord, config: &CrashConfig) -> Result<Multiplier, VerifyError> {
    if !record.commitment_holds() {
        return Err(VerifyError::CommitmentMismatch);
    }

    if record.record_hash != record.compute_hash() {
        return Err(VerifyError::RecordHashMismatch { nonce: record.nonce });
    }

    let derived = derive(&record.server_seed, &record.client_seed_used, record.nonce, config);
    if let Some(recorded) = record.crash_point {
        if recorded != derived {
            return Err(VerifyError::CrashPointMismatch { expected: derived, got: recorded });
        }
    }

    Ok(derived)
}

/// Verify a reveal against the commitment a client saw before betting.
pub fn verify_against_commitment(
    record: &AuditRecord,
    commitment: &SeedCommitment,
    config: &CrashConfig,
) -> Result<Multiplier, VerifyError> {
    if record.server_seed_hash != commitment.server_seed_hash
        || record.nonce != commitment.nonce
        || record.client_seed_used != commitment.client_seed
    {
        return Err(VerifyError::PublishedHashMismatch { nonce: record.nonce });
    }
    verify_reveal(record, config)
}

/// Verify the hash chain over an ordered slice of records.
///
/// `anchor` is the `record_hash` preceding the first record (zeros for the
/// start of the log).
pub fn verify_chain(records: &[AuditRecord], anchor: Digest32) -> Result<(), VerifyError> {
    let mut previous = anchor;
    let mut last_nonce: Option<u64> = None;

    for record in records {
        if last_nonce.is_some_and(|n| record.nonce <= n) {
            return Err(VerifyError::NonceOrder { nonce: record.nonce });
        }
        if record.previous_hash != previous {
            return Err(VerifyError::BrokenChain { nonce: record.nonce });
        }
        if record.record_hash != record.compute_hash() {
            return Err(VerifyError::RecordHashMismatch { nonce: record.nonce });
        }
        previous = record.record_hash;
        last_nonce = Some(record.nonce);
    }

    Ok(())
}
