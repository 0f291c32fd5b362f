//! Ledger Entries
//!
//! Append-only audit trail. For every user and currency the sum of entry
//! deltas equals the current balance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::amount::Amount;
use crate::ledger::balance::{Balance, Currency, UserId};
use crate::round::state::RoundId;

/// Why a balance changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryReason {
    /// Bet stake taken at placement.
    Stake,
    /// Winnings credited at settlement.
    Payout,
    /// Funds added from outside the game.
    Deposit,
    /// Manual correction.
    Adjustment,
}

/// One balance-affecting event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Affected user.
    pub user_id: UserId,
    /// Affected currency.
    pub currency: Currency,
    /// Signed change.
    pub delta: Amount,
    /// Reason code.
    pub reason: EntryReason,
    /// Round the entry belongs to, for stakes and payouts.
    pub round_id: Option<RoundId>,
    /// Idempotency key for credits.
    pub idempotency_key: Option<String>,
    /// Balance version produced by this entry.
    pub version: u64,
    /// Wall-clock time of the mutation.
    pub timestamp: DateTime<Utc>,
}

/// Change notification emitted after every applied mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BalanceChange {
    /// Balance after the mutation.
    pub balance: Balance,
    /// The entry that produced it.
    pub entry: LedgerEntry,
}

/// Result of an applied (or replayed) mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    /// Balance right after the original mutation.
    pub balance: Balance,
    /// Entry written by the original mutation.
    pub entry: LedgerEntry,
    /// True when this call matched an earlier idempotency key and changed nothing.
    pub replayed: bool,
}
