//! Server Seed Commit/Reveal Lifecycle
//!
//! Each round is governed by one server seed:
//!
//! ```text
//! commit ──► (hash published, secret held) ──► crash_point ──► mark_settled ──► reveal
//!    ▲                                                                           │
//!    └───────────────────────────── rotate ◄─────────────────────────────────────┘
//! ```
//!
//! The secret never leaves this module before the governed round has settled.
//! Revealed seeds are appended to a hash-chained audit log keyed by nonce.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::amount::Multiplier;
use crate::core::entropy::{EntropyError, EntropySource, OsEntropy, SEED_LEN};
use crate::core::hash::{hex_digest, sha256, Digest32, RecordHasher};
use crate::fair::crash::{derive, CrashConfig};
use crate::round::state::RoundId;

/// Secret server seed. Debug output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerSeed([u8; SEED_LEN]);

impl ServerSeed {
    /// Wrap raw seed bytes.
    pub fn new(bytes: [u8; SEED_LEN]) -> Self {
        Self(bytes)
    }

    /// SHA-256 commitment of this seed.
    pub fn commitment_hash(&self) -> Digest32 {
        sha256(&self.0)
    }

    fn bytes(&self) -> &[u8; SEED_LEN] {
        &self.0
    }
}

impl fmt::Debug for ServerSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerSeed(<redacted>)")
    }
}

/// Public half of a seed pair, published before betting opens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedCommitment {
    /// Round governed by this seed.
    pub round_id: RoundId,
    /// SHA-256 of the server seed.
    #[serde(with = "hex_digest")]
    pub server_seed_hash: Digest32,
    /// Public client seed mixed into the derivation.
    pub client_seed: String,
    /// Monotonic nonce.
    pub nonce: u64,
}

/// Append-only public record of a retired seed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Nonce of the governed round.
    pub nonce: u64,
    /// Governed round.
    pub round_id: RoundId,
    /// Commitment published before betting.
    #[serde(with = "hex_digest")]
    pub server_seed_hash: Digest32,
    /// Revealed secret.
    #[serde(with = "hex_digest")]
    pub server_seed: Digest32,
    /// Client seed used in the derivation.
    pub client_seed_used: String,
    /// Crash point used during settlement, if the round ran.
    pub crash_point: Option<Multiplier>,
    /// False when the seed was retired without its round settling.
    pub settled: bool,
    /// Hash of the preceding record (zeros for the first).
    #[serde(with = "hex_digest")]
    pub previous_hash: Digest32,
    /// Hash over this record's fields and `previous_hash`.
    #[serde(with = "hex_digest")]
    pub record_hash: Digest32,
}

impl AuditRecord {
    /// Recompute the chained record hash from the other fields.
    pub fn compute_hash(&self) -> Digest32 {
        let mut hasher = RecordHasher::for_audit_record();
        hasher.update_u64(self.nonce);
        hasher.update_bytes(self.round_id.as_bytes());
        hasher.update_bytes(&self.server_seed_hash);
        hasher.update_bytes(&self.server_seed);
        hasher.update_str(&self.client_seed_used);
        hasher.update_u64(self.crash_point.unwrap_or(0));
        hasher.update_bytes(&[self.settled as u8]);
        hasher.update_bytes(&self.previous_hash);
        hasher.finalize()
    }

    /// Check that the revealed seed hashes to the published commitment.
    pub fn commitment_holds(&self) -> bool {
        sha256(&self.server_seed) == self.server_seed_hash
    }
}

/// Seed lifecycle errors.
#[derive(Debug, Clone, Error)]
pub enum SeedError {
    /// Reveal requested before the round settled.
    #[error("seed for round {0} cannot be revealed before settlement")]
    PrematureReveal(RoundId),

    /// No seed is bound to this round.
    #[error("no seed bound to round {0}")]
    UnknownRound(RoundId),

    /// The entropy source failed. Fatal for round commitment.
    #[error("entropy failure: {0}")]
    EntropyFailure(#[from] EntropyError),
}

struct ActiveSeed {
    round_id: RoundId,
    seed: ServerSeed,
    hash: Digest32,
    client_seed: String,
    nonce: u64,
    settled: bool,
    revealed: bool,
    crash_point: Option<Multiplier>,
}

impl ActiveSeed {
    fn commitment(&self) -> SeedCommitment {
        SeedCommitment {
            round_id: self.round_id,
            server_seed_hash: self.hash,
            client_seed: self.client_seed.clone(),
            nonce: self.nonce,
        }
    }
}

struct SeedState {
    active: Option<ActiveSeed>,
    next_nonce: u64,
    client_seed: String,
    audit: Vec<AuditRecord>,
}

impl SeedState {
    fn append_record(&mut self, active: &ActiveSeed) -> AuditRecord {
        let previous_hash = self.audit.last().map(|r| r.record_hash).unwrap_or([0; 32]);
        let mut record = AuditRecord {
            nonce: active.nonce,
            round_id: active.round_id,
            server_seed_hash: active.hash,
            server_seed: *active.seed.bytes(),
            client_seed_used: active.client_seed.clone(),
            crash_point: active.crash_point,
            settled: active.settled,
            previous_hash,
            record_hash: [0; 32],
        };
        record.record_hash = record.compute_hash();
        self.audit.push(record.clone());
        record
    }

    fn record_for_round(&self, round_id: &RoundId) -> Option<&AuditRecord> {
        self.audit.iter().rev().find(|r| &r.round_id == round_id)
    }
}

/// Owner of the commit/reveal lifecycle.
pub struct SeedManager {
    entropy: Arc<dyn EntropySource>,
    state: Mutex<SeedState>,
}

impl SeedManager {
    /// Create a manager drawing seeds from `entropy`.
    pub fn new(entropy: Arc<dyn EntropySource>, client_seed: impl Into<String>) -> Self {
        Self {
            entropy,
            state: Mutex::new(SeedState {
                active: None,
                next_nonce: 1,
                client_seed: client_seed.into(),
                audit: Vec::new(),
            }),
        }
    }

    /// Create a manager backed by the OS CSPRNG.
    pub fn with_os_entropy(client_seed: impl Into<String>) -> Self {
        Self::new(Arc::new(OsEntropy), client_seed)
    }

    /// Commit a fresh seed for `round_id` and return its public half.
    ///
    /// If a seed is already active, its commitment is returned unchanged:
    /// only [`SeedManager::rotate`] advances the active seed.
    pub async fn commit(&self, round_id: RoundId) -> Result<SeedCommitment, SeedError> {
        let mut state = self.state.lock().await;
        if let Some(active) = &state.active {
            return Ok(active.commitment());
        }
        self.commit_locked(&mut state, round_id)
    }

    /// Retire the seed of `retiring` and commit a new one for `next`.
    ///
    /// Concurrent callers are serialized. A caller whose `retiring` round has
    /// already been rotated away receives the commitment the first caller
    /// created, so the returned `round_id` is authoritative.
    pub async fn rotate(&self, retiring: RoundId, next: RoundId) -> Result<SeedCommitment, SeedError> {
        let mut state = self.state.lock().await;

        match state.active.take() {
            Some(active) if active.round_id == retiring => {
                if !active.revealed {
                    warn!(round = %retiring, nonce = active.nonce, "Retiring unrevealed seed into audit log");
                    state.append_record(&active);
                }
            }
            Some(active) => {
                debug!(round = %retiring, current = %active.round_id, "Rotation already performed");
                let commitment = active.commitment();
                state.active = Some(active);
                return Ok(commitment);
            }
            None => {}
        }

        self.commit_locked(&mut state, next)
    }

    fn commit_locked(&self, state: &mut SeedState, round_id: RoundId) -> Result<SeedCommitment, SeedError> {
        let seed = ServerSeed::new(self.entropy.fill_seed()?);
        let hash = seed.commitment_hash();
        let nonce = state.next_nonce;
        state.next_nonce += 1;

        let active = ActiveSeed {
            round_id,
            seed,
            hash,
            client_seed: state.client_seed.clone(),
            nonce,
            settled: false,
            revealed: false,
            crash_point: None,
        };
        let commitment = active.commitment();
        state.active = Some(active);

        info!(round = %round_id, nonce, hash = %hex::encode(hash), "Committed server seed");
        Ok(commitment)
    }

    /// Derive the crash point for the active round without exposing the seed.
    pub async fn crash_point(&self, round_id: RoundId, config: &CrashConfig) -> Result<Multiplier, SeedError> {
        let mut state = self.state.lock().await;
        let active = match state.active.as_mut() {
            Some(active) if active.round_id == round_id => active,
            _ => return Err(SeedError::UnknownRound(round_id)),
        };
        let crash = derive(active.seed.bytes(), &active.client_seed, active.nonce, config);
        active.crash_point = Some(crash);
        Ok(crash)
    }

    /// Record that `round_id` reached a terminal, fully settled state.
    pub async fn mark_settled(&self, round_id: RoundId) -> Result<(), SeedError> {
        let mut state = self.state.lock().await;
        match state.active.as_mut() {
            Some(active) if active.round_id == round_id => {
                active.settled = true;
                Ok(())
            }
            _ => Err(SeedError::UnknownRound(round_id)),
        }
    }

    /// Disclose the seed of a settled round and append it to the audit log.
    ///
    /// Repeated calls return the record already written.
    pub async fn reveal(&self, round_id: RoundId) -> Result<AuditRecord, SeedError> {
        let mut state = self.state.lock().await;

        let (already_revealed, settled) = match &state.active {
            Some(active) if active.round_id == round_id => (active.revealed, active.settled),
            _ => {
                return state
                    .record_for_round(&round_id)
                    .filter(|r| r.settled)
                    .cloned()
                    .ok_or(SeedError::UnknownRound(round_id));
            }
        };

        if !settled {
            return Err(SeedError::PrematureReveal(round_id));
        }
        if already_revealed {
            return state
                .record_for_round(&round_id)
                .cloned()
                .ok_or(SeedError::UnknownRound(round_id));
        }

        let mut active = match state.active.take() {
            Some(active) => active,
            None => return Err(SeedError::UnknownRound(round_id)),
        };
        let record = state.append_record(&active);
        active.revealed = true;
        state.active = Some(active);

        info!(round = %round_id, nonce = record.nonce, "Revealed server seed");
        Ok(record)
    }

    /// Set the public client seed used from the next commitment on.
    pub async fn set_client_seed(&self, client_seed: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.client_seed = client_seed.into();
    }

    /// Public half of the active seed, if any.
    pub async fn current_commitment(&self) -> Option<SeedCommitment> {
        let state = self.state.lock().await;
        state.active.as_ref().map(ActiveSeed::commitment)
    }

    /// Full audit log, ordered by nonce.
    pub async fn audit_log(&self) -> Vec<AuditRecord> {
        self.state.lock().await.audit.clone()
    }

    /// Audit record for one nonce.
    pub async fn audit_record(&self, nonce: u64) -> Option<AuditRecord> {
        let state = self.state.lock().await;
        state
            .audit
            .binary_search_by_key(&nonce, |r| r.nonce)
            .ok()
            .map(|idx| state.audit[idx].clone())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct FailingEntropy;

    impl EntropySource for FailingEntropy {
        fn fill_seed(&self) -> Result<[u8; SEED_LEN], EntropyError> {
            Err(EntropyError("device unavailable".into()))
        }
    }

    fn manager() -> SeedManager {
        SeedManager::with_os_entropy("public-client-seed")
    }

    async fn settle_and_reveal(seeds: &SeedManager, round: RoundId) -> AuditRecord {
        seeds.crash_point(round, &CrashConfig::default()).await.unwrap();
        seeds.mark_settled(round).await.unwrap();
        seeds.reveal(round).await.unwrap()
    }

    #[tokio::test]
    async fn test_commit_publishes_hash_only() {
        let seeds = manager();
        let round = Uuid::new_v4();
        let commitment = seeds.commit(round).await.unwrap();

        assert_eq!(commitment.round_id, round);
        assert_eq!(commitment.nonce, 1);
        assert_eq!(commitment.client_seed, "public-client-seed");
        assert!(seeds.audit_log().await.is_empty());

        let json = serde_json::to_string(&commitment).unwrap();
        assert!(json.contains("serverSeedHash"));
        assert!(!json.contains("serverSeed\""));
    }

    #[tokio::test]
    async fn test_commit_is_idempotent_while_active() {
        let seeds = manager();
        let first = seeds.commit(Uuid::new_v4()).await.unwrap();
        let second = seeds.commit(Uuid::new_v4()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_reveal_before_settlement_fails() {
        let seeds = manager();
        let round = Uuid::new_v4();
        seeds.commit(round).await.unwrap();

        let result = seeds.reveal(round).await;
        assert!(matches!(result, Err(SeedError::PrematureReveal(r)) if r == round));
    }

    #[tokio::test]
    async fn test_reveal_binds_to_commitment() {
        let seeds = manager();
        let round = Uuid::new_v4();
        let commitment = seeds.commit(round).await.unwrap();
        let config = CrashConfig { house_edge_bps: 100, ..Default::default() };
        let crash = seeds.crash_point(round, &config).await.unwrap();
        seeds.mark_settled(round).await.unwrap();

        let record = seeds.reveal(round).await.unwrap();
        assert!(record.commitment_holds());
        assert_eq!(record.server_seed_hash, commitment.server_seed_hash);
        assert_eq!(record.nonce, commitment.nonce);
        assert_eq!(record.crash_point, Some(crash));
        assert_eq!(derive(&record.server_seed, &record.client_seed_used, record.nonce, &config), crash);

        // Repeated reveal returns the same record without appending
        assert_eq!(seeds.reveal(round).await.unwrap(), record);
        assert_eq!(seeds.audit_log().await.len(), 1);
    }

    #[tokio::test]
    async fn test_rotate_advances_nonce_and_chains() {
        let seeds = manager();
        let r1 = Uuid::new_v4();
        seeds.commit(r1).await.unwrap();
        let rec1 = settle_and_reveal(&seeds, r1).await;

        let r2 = Uuid::new_v4();
        let c2 = seeds.rotate(r1, r2).await.unwrap();
        assert_eq!(c2.round_id, r2);
        assert_eq!(c2.nonce, 2);

        let rec2 = settle_and_reveal(&seeds, r2).await;
        assert_eq!(rec2.previous_hash, rec1.record_hash);
        assert_eq!(rec1.previous_hash, [0; 32]);
        assert_eq!(rec2.record_hash, rec2.compute_hash());
        assert_eq!(seeds.audit_record(2).await, Some(rec2));
        assert_eq!(seeds.audit_record(9).await, None);
    }

    #[tokio::test]
    async fn test_rotate_retires_unrevealed_seed() {
        let seeds = manager();
        let r1 = Uuid::new_v4();
        let c1 = seeds.commit(r1).await.unwrap();
        seeds.rotate(r1, Uuid::new_v4()).await.unwrap();

        let log = seeds.audit_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].server_seed_hash, c1.server_seed_hash);
        assert!(!log[0].settled);
        assert!(log[0].commitment_holds());
        // An unsettled round's record is not handed out as a reveal
        assert!(matches!(seeds.reveal(r1).await, Err(SeedError::UnknownRound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_rotate_commits_once() {
        let seeds = Arc::new(manager());
        let r1 = Uuid::new_v4();
        seeds.commit(r1).await.unwrap();
        settle_and_reveal(&seeds, r1).await;

        let a = {
            let seeds = seeds.clone();
            tokio::spawn(async move { seeds.rotate(r1, Uuid::new_v4()).await })
        };
        let b = {
            let seeds = seeds.clone();
            tokio::spawn(async move { seeds.rotate(r1, Uuid::new_v4()).await })
        };

        let ca = a.await.unwrap().unwrap();
        let cb = b.await.unwrap().unwrap();
        assert_eq!(ca, cb);
        assert_eq!(ca.nonce, 2);
        assert_eq!(seeds.audit_log().await.len(), 1);
    }

    #[tokio::test]
    async fn test_client_seed_applies_at_next_commit() {
        let seeds = manager();
        let r1 = Uuid::new_v4();
        seeds.commit(r1).await.unwrap();
        seeds.set_client_seed("block-812345").await;

        assert_eq!(seeds.current_commitment().await.unwrap().client_seed, "public-client-seed");
        let c2 = seeds.rotate(r1, Uuid::new_v4()).await.unwrap();
        assert_eq!(c2.client_seed, "block-812345");
    }

    #[tokio::test]
    async fn test_entropy_failure_is_reported() {
        let seeds = SeedManager::new(Arc::new(FailingEntropy), "");
        let result = seeds.commit(Uuid::new_v4()).await;
        assert!(matches!(result, Err(SeedError::EntropyFailure(_))));
        assert!(seeds.current_commitment().await.is_none());
    }

    #[tokio::test]
    async fn test_crash_point_requires_active_round() {
        let seeds = manager();
        seeds.commit(Uuid::new_v4()).await.unwrap();
        let other = Uuid::new_v4();
        let result = seeds.crash_point(other, &CrashConfig::default()).await;
        assert!(matches!(result, Err(SeedError::UnknownRound(r)) if r == other));
    }

    #[test]
    fn test_server_seed_debug_redacted() {
        let seed = ServerSeed::new([0xAB; SEED_LEN]);
        let debug = format!("{:?}", seed);
        assert!(!debug.contains("ab"));
        assert!(!debug.contains("171"));
    }
}
