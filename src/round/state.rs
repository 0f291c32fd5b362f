//! Round State Machine
//!
//! One round at a time, owned and mutated only by the engine task.
//!
//! ```text
//! Committing ──► Betting ──► Running ──► Crashed ──► Settling ──► Settled
//! ```
//!
//! Nothing here reads a clock. The engine passes in server-observed elapsed
//! time, so every transition and every cash-out decision is reproducible.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::amount::{apply_multiplier, Amount, Multiplier, MULTIPLIER_ONE};
use crate::core::hash::{hex_digest, Digest32};
use crate::fair::clock::MultiplierClock;
use crate::fair::seed::SeedCommitment;
use crate::ledger::balance::{Currency, UserId};
use crate::ledger::book::LedgerError;

/// Unique round identifier.
pub type RoundId = uuid::Uuid;

/// Round lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    /// Seed being committed.
    Committing,
    /// Accepting bets.
    Betting,
    /// Multiplier climbing, cash-outs accepted.
    Running,
    /// Crash point reached.
    Crashed,
    /// Paying out winners.
    Settling,
    /// Terminal; the seed may be revealed.
    Settled,
}

/// Resolution of a bet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetOutcome {
    /// Waiting for cash-out or crash.
    Open,
    /// Cashed out before the crash.
    Won,
    /// Still open when the round crashed.
    Lost,
}

/// A player's wager on one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bet {
    /// Bettor.
    pub user_id: UserId,
    /// Stake debited at placement.
    pub stake: Amount,
    /// Stake currency.
    pub currency: Currency,
    /// Multiplier locked in at cash-out.
    pub cashed_out_at: Option<Multiplier>,
    /// Server time the bet was accepted.
    pub placed_at: DateTime<Utc>,
    /// Resolution.
    pub outcome: BetOutcome,
}

impl Bet {
    /// Create an open bet.
    pub fn new(user_id: UserId, stake: Amount, currency: Currency, placed_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            stake,
            currency,
            cashed_out_at: None,
            placed_at,
            outcome: BetOutcome::Open,
        }
    }

    /// Amount owed to the bettor, if the bet won.
    pub fn payout(&self) -> Option<Amount> {
        match (self.outcome, self.cashed_out_at) {
            (BetOutcome::Won, Some(multiplier)) => apply_multiplier(self.stake, multiplier),
            _ => None,
        }
    }
}

/// A credit the engine owes at settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payout {
    /// Recipient.
    pub user_id: UserId,
    /// Currency of the original stake.
    pub currency: Currency,
    /// Stake times locked multiplier.
    pub amount: Amount,
    /// Locked multiplier.
    pub multiplier: Multiplier,
    /// Exactly-once key for the ledger credit.
    pub idempotency_key: String,
}

/// Idempotency key for a round payout.
pub fn payout_key(round_id: &RoundId, user_id: &UserId) -> String {
    format!("payout:{}:{}", round_id, user_id)
}

/// Errors surfaced to bettors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoundError {
    /// Bet arrived outside the betting window.
    #[error("betting is closed")]
    BettingClosed,

    /// Cash-out arrived at or after the crash instant.
    #[error("too late: the round has crashed")]
    TooLate,

    /// User already holds a bet in this round.
    #[error("duplicate bet")]
    DuplicateBet,

    /// User has no bet in this round.
    #[error("no open bet")]
    NoOpenBet,

    /// Bet was already cashed out.
    #[error("already cashed out")]
    AlreadyCashedOut,

    /// Cash-out requested before the multiplier started.
    #[error("round is not running")]
    NotRunning,

    /// Stake must be positive.
    #[error("invalid stake")]
    InvalidStake,

    /// Transition not allowed from the current state.
    #[error("invalid transition from {0:?}")]
    InvalidTransition(RoundState),

    /// Round engine stopped or is not reachable.
    #[error("round engine unavailable")]
    EngineUnavailable,

    /// Stake times multiplier does not fit an amount.
    #[error("payout overflow for {0}")]
    PayoutOverflow(UserId),

    /// Ledger rejected the stake.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl RoundError {
    /// Stable reason code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BettingClosed => "BettingClosed",
            Self::TooLate => "TooLate",
            Self::DuplicateBet => "DuplicateBet",
            Self::NoOpenBet => "NoOpenBet",
            Self::AlreadyCashedOut => "AlreadyCashedOut",
            Self::NotRunning => "NotRunning",
            Self::InvalidStake => "InvalidStake",
            Self::InvalidTransition(_) => "InvalidTransition",
            Self::EngineUnavailable => "EngineUnavailable",
            Self::PayoutOverflow(_) => "PayoutOverflow",
            Self::Ledger(LedgerError::InsufficientFunds { .. }) => "InsufficientFunds",
            Self::Ledger(_) => "LedgerError",
        }
    }
}

/// Public bet view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetView {
    /// Bettor.
    pub user_id: UserId,
    /// Stake.
    pub stake: Amount,
    /// Currency.
    pub currency: Currency,
    /// Locked multiplier.
    pub cashed_out_at: Option<Multiplier>,
    /// Resolution.
    pub outcome: BetOutcome,
}

/// Public, versioned view of the live round for resynchronizing clients.
///
/// The crash point is present only once the round has crashed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSnapshot {
    /// Round identifier.
    pub round_id: RoundId,
    /// Lifecycle state.
    pub state: RoundState,
    /// Published seed commitment.
    #[serde(with = "hex_digest")]
    pub server_seed_hash: Digest32,
    /// Seed nonce.
    pub nonce: u64,
    /// Client seed mixed into derivation.
    pub client_seed: String,
    /// End of the betting window.
    pub betting_closes_at: DateTime<Utc>,
    /// When the multiplier started.
    pub started_at: Option<DateTime<Utc>>,
    /// Server elapsed time since start.
    pub elapsed_ms: Option<u64>,
    /// Displayed multiplier at `elapsed_ms`.
    pub multiplier: Multiplier,
    /// Revealed after the crash.
    pub crash_point: Option<Multiplier>,
    /// Clock parameters so clients can animate locally.
    pub clock: MultiplierClock,
    /// All bets in the round.
    pub bets: Vec<BetView>,
    /// Incremented on every round mutation.
    pub version: u64,
}

/// Round commitment publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundCommitment {
    /// Round identifier.
    pub round_id: RoundId,
    /// SHA-256 of the server seed.
    #[serde(with = "hex_digest")]
    pub server_seed_hash: Digest32,
    /// Seed nonce.
    pub nonce: u64,
    /// Client seed.
    pub client_seed: String,
    /// Lifecycle state at publication.
    pub state: RoundState,
    /// End of the betting window.
    pub betting_closes_at: DateTime<Utc>,
}

/// The live round.
#[derive(Debug, Clone)]
pub struct Round {
    id: RoundId,
    state: RoundState,
    commitment: SeedCommitment,
    clock: MultiplierClock,
    max_multiplier: Multiplier,
    betting_closes_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    crash_point: Option<Multiplier>,
    crash_elapsed_ms: Option<u64>,
    bets: BTreeMap<UserId, Bet>,
    version: u64,
}

impl Round {
    /// Create a round bound to a committed seed.
    ///
    /// `max_multiplier` caps the crash point; every accepted stake can be
    /// paid out at it.
    pub fn new(
        commitment: SeedCommitment,
        clock: MultiplierClock,
        max_multiplier: Multiplier,
        betting_closes_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: commitment.round_id,
            state: RoundState::Committing,
            commitment,
            clock,
            max_multiplier: max_multiplier.max(MULTIPLIER_ONE),
            betting_closes_at,
            started_at: None,
            crash_point: None,
            crash_elapsed_ms: None,
            bets: BTreeMap::new(),
            version: 0,
        }
    }

    /// Round identifier.
    pub fn id(&self) -> RoundId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> RoundState {
        self.state
    }

    /// Seed commitment governing this round.
    pub fn commitment(&self) -> &SeedCommitment {
        &self.commitment
    }

    /// Elapsed time at which the round crashes, once running.
    pub fn crash_elapsed_ms(&self) -> Option<u64> {
        self.crash_elapsed_ms
    }

    /// Bets, ordered by user id.
    pub fn bets(&self) -> impl Iterator<Item = &Bet> {
        self.bets.values()
    }

    /// Number of bets.
    pub fn bet_count(&self) -> usize {
        self.bets.len()
    }

    /// Bet held by `user_id`.
    pub fn bet(&self, user_id: &UserId) -> Option<&Bet> {
        self.bets.get(user_id)
    }

    /// Committing -> Betting.
    pub fn open_betting(&mut self) -> Result<(), RoundError> {
        self.transition(RoundState::Committing, RoundState::Betting)
    }

    /// Validate a bet without taking it.
    ///
    /// The engine checks, debits the stake, then calls [`Round::accept_bet`].
    pub fn check_bet(&self, user_id: &UserId, stake: Amount) -> Result<(), RoundError> {
        if self.state != RoundState::Betting {
            return Err(RoundError::BettingClosed);
        }
        if stake <= 0 || apply_multiplier(stake, self.max_multiplier).is_none() {
            return Err(RoundError::InvalidStake);
        }
        if self.bets.contains_key(user_id) {
            return Err(RoundError::DuplicateBet);
        }
        Ok(())
    }

    /// Record a bet whose stake has been debited.
    pub fn accept_bet(&mut self, bet: Bet) -> Result<(), RoundError> {
        self.check_bet(&bet.user_id, bet.stake)?;
        self.bets.insert(bet.user_id.clone(), bet);
        self.version += 1;
        Ok(())
    }

    /// Betting -> Running with the precomputed crash point.
    ///
    /// Returns the elapsed time at which the round must crash.
    pub fn start_running(
        &mut self,
        crash_point: Multiplier,
        started_at: DateTime<Utc>,
    ) -> Result<u64, RoundError> {
        self.transition(RoundState::Betting, RoundState::Running)?;
        let crash_point = crash_point.clamp(MULTIPLIER_ONE, self.max_multiplier);
        let crash_elapsed = self.clock.crash_elapsed_ms(crash_point);
        self.crash_point = Some(crash_point);
        self.crash_elapsed_ms = Some(crash_elapsed);
        self.started_at = Some(started_at);
        Ok(crash_elapsed)
    }

    /// Lock in the multiplier at server-observed `elapsed_ms`.
    pub fn cash_out(&mut self, user_id: &UserId, elapsed_ms: u64) -> Result<Multiplier, RoundError> {
        match self.state {
            RoundState::Running => {}
            RoundState::Committing | RoundState::Betting => return Err(RoundError::NotRunning),
            _ => return Err(RoundError::TooLate),
        }

        let crash_elapsed = self.crash_elapsed_ms.ok_or(RoundError::NotRunning)?;
        let bet = self.bets.get_mut(user_id).ok_or(RoundError::NoOpenBet)?;
        match bet.outcome {
            BetOutcome::Open => {}
            BetOutcome::Won => return Err(RoundError::AlreadyCashedOut),
            BetOutcome::Lost => return Err(RoundError::TooLate),
        }
        if elapsed_ms >= crash_elapsed {
            return Err(RoundError::TooLate);
        }

        let multiplier = self.clock.multiplier_at(elapsed_ms);
        if apply_multiplier(bet.stake, multiplier).is_none() {
            return Err(RoundError::PayoutOverflow(user_id.clone()));
        }
        bet.cashed_out_at = Some(multiplier);
        bet.outcome = BetOutcome::Won;
        self.version += 1;
        Ok(multiplier)
    }

    /// Running -> Crashed. Open bets are lost.
    pub fn crash(&mut self) -> Result<Multiplier, RoundError> {
        self.transition(RoundState::Running, RoundState::Crashed)?;
        for bet in self.bets.values_mut() {
            if bet.outcome == BetOutcome::Open {
                bet.outcome = BetOutcome::Lost;
            }
        }
        Ok(self.crash_point.unwrap_or(MULTIPLIER_ONE))
    }

    /// Crashed -> Settling, returning the credit owed to every winner.
    ///
    /// Fails without changing state if any winning payout is not representable.
    pub fn begin_settlement(&mut self) -> Result<Vec<Payout>, RoundError> {
        if self.state != RoundState::Crashed {
            return Err(RoundError::InvalidTransition(self.state));
        }

        let mut payouts = Vec::new();
        for bet in self.bets.values() {
            let Some(multiplier) = bet.cashed_out_at else {
                continue;
            };
            let amount = bet
                .payout()
                .ok_or_else(|| RoundError::PayoutOverflow(bet.user_id.clone()))?;
            payouts.push(Payout {
                user_id: bet.user_id.clone(),
                currency: bet.currency,
                amount,
                multiplier,
                idempotency_key: payout_key(&self.id, &bet.user_id),
            });
        }

        self.transition(RoundState::Crashed, RoundState::Settling)?;
        Ok(payouts)
    }

    /// Settling -> Settled.
    pub fn mark_settled(&mut self) -> Result<(), RoundError> {
        self.transition(RoundState::Settling, RoundState::Settled)
    }

    /// Displayed multiplier at `elapsed_ms`, capped at the crash point.
    pub fn multiplier_at(&self, elapsed_ms: u64) -> Multiplier {
        match self.state {
            RoundState::Committing | RoundState::Betting => MULTIPLIER_ONE,
            RoundState::Running => {
                let shown = self.clock.multiplier_at(elapsed_ms);
                // Never display the crash point while running
                match self.crash_elapsed_ms {
                    Some(end) if elapsed_ms >= end => self.clock.multiplier_at(end.saturating_sub(1)),
                    _ => shown,
                }
            }
            _ => self.crash_point.unwrap_or(MULTIPLIER_ONE),
        }
    }

    /// Public commitment for this round.
    pub fn publication(&self) -> RoundCommitment {
        RoundCommitment {
            round_id: self.id,
            server_seed_hash: self.commitment.server_seed_hash,
            nonce: self.commitment.nonce,
            client_seed: self.commitment.client_seed.clone(),
            state: self.state,
            betting_closes_at: self.betting_closes_at,
        }
    }

    /// Versioned public view. `elapsed_ms` is the server's elapsed running time.
    pub fn snapshot(&self, elapsed_ms: Option<u64>) -> RoundSnapshot {
        let revealed = self.state >= RoundState::Crashed;
        RoundSnapshot {
            round_id: self.id,
            state: self.state,
            server_seed_hash: self.commitment.server_seed_hash,
            nonce: self.commitment.nonce,
            client_seed: self.commitment.client_seed.clone(),
            betting_closes_at: self.betting_closes_at,
            started_at: self.started_at,
            elapsed_ms,
            multiplier: self.multiplier_at(elapsed_ms.unwrap_or(0)),
            crash_point: if revealed { self.crash_point } else { None },
            clock: self.clock,
            bets: self
                .bets
                .values()
                .map(|b| BetView {
                    user_id: b.user_id.clone(),
                    stake: b.stake,
                    currency: b.currency,
                    cashed_out_at: b.cashed_out_at,
                    outcome: b.outcome,
                })
                .collect(),
            version: self.version,
        }
    }

    fn transition(&mut self, from: RoundState, to: RoundState) -> Result<(), RoundError> {
        if self.state != from {
            return Err(RoundError::InvalidTransition(self.state));
        }
        self.state = to;
        self.version += 1;
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
