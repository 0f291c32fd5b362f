//! Balance Ledger
//!
//! Authoritative per-user balance store.
//!
//! ## Concurrency
//!
//! ```text
//! accounts: RwLock<BTreeMap<UserId, Arc<Account>>>   lookup / insert only
//!                                   │
//!                   ┌───────────────┴───────────────┐
//!                   │ Account                       │
//!                   │  book: Mutex<AccountBook>     │  single writer per user
//!                   │  snapshot: watch<Balance>     │  readers, never torn
//!                   └───────────────────────────────┘
//! ```
//!
//! No lock spans two users. Change events are sent while the user's writer
//! lock is held, so one user's events leave in mutation order.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, instrument};

use crate::core::amount::{format_amount, Amount};
use crate::ledger::balance::{Balance, Currency, UserId};
use crate::ledger::entry::{BalanceChange, EntryReason, LedgerEntry, Receipt};
use crate::round::state::RoundId;

/// Default capacity of the change event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Ledger errors. No failed operation leaves a partial mutation behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Debit would take the balance below zero.
    #[error("insufficient funds: needed {}, available {}", format_amount(*.needed), format_amount(*.available))]
    InsufficientFunds {
        /// Requested amount.
        needed: Amount,
        /// Balance at the time of the request.
        available: Amount,
    },

    /// Amount must be strictly positive.
    #[error("invalid amount: {0}")]
    InvalidAmount(Amount),

    /// Credit would overflow the balance.
    #[error("balance overflow")]
    Overflow,

    /// Entries do not sum to the balance.
    #[error("reconciliation failed for {currency}: entries sum to {entries}, balance is {balance}")]
    Reconciliation {
        /// Currency that failed.
        currency: Currency,
        /// Sum of entry deltas.
        entries: Amount,
        /// Stored balance.
        balance: Amount,
    },
}

struct AccountBook {
    balance: Balance,
    entries: Vec<LedgerEntry>,
    receipts: BTreeMap<String, Receipt>,
}

struct Account {
    book: Mutex<AccountBook>,
    snapshot: watch::Sender<Balance>,
}

impl Account {
    fn new(user_id: UserId) -> Self {
        let balance = Balance::empty(user_id);
        let (snapshot, _) = watch::channel(balance.clone());
        Self {
            book: Mutex::new(AccountBook {
                balance,
                entries: Vec::new(),
                receipts: BTreeMap::new(),
            }),
            snapshot,
        }
    }
}

/// Authoritative balance store with atomic credit/debit and change events.
pub struct BalanceLedger {
    accounts: RwLock<BTreeMap<UserId, Arc<Account>>>,
    events: broadcast::Sender<BalanceChange>,
}

impl BalanceLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create an empty ledger with a custom change channel capacity.
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            accounts: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Subscribe to change events for all users.
    pub fn subscribe(&self) -> broadcast::Receiver<BalanceChange> {
        self.events.subscribe()
    }

    /// Snapshot of a user's balance.
    ///
    /// Never blocks on, or observes part of, an in-flight mutation.
    pub async fn read(&self, user_id: &UserId) -> Balance {
        let accounts = self.accounts.read().await;
        match accounts.get(user_id) {
            Some(account) => account.snapshot.borrow().clone(),
            None => Balance::empty(user_id.clone()),
        }
    }

    /// Take `amount` from the user's balance.
    #[instrument(skip(self), level = "debug")]
    pub async fn debit(
        &self,
        user_id: &UserId,
        amount: Amount,
        currency: Currency,
        reason: EntryReason,
        round_id: Option<RoundId>,
    ) -> Result<Receipt, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let account = self.account(user_id).await;
        let mut book = account.book.lock().await;

        let available = book.balance.get(currency);
        if available < amount {
            return Err(LedgerError::InsufficientFunds { needed: amount, available });
        }

        Ok(self.apply(&account, &mut book, currency, -amount, reason, round_id, None))
    }

    /// Add `amount` to the user's balance exactly once per `idempotency_key`.
    ///
    /// A repeated key returns the original receipt with `replayed` set and
    /// leaves the balance untouched.
    #[instrument(skip(self, idempotency_key), level = "debug")]
    pub async fn credit(
        &self,
        user_id: &UserId,
        amount: Amount,
        currency: Currency,
        reason: EntryReason,
        round_id: Option<RoundId>,
        idempotency_key: impl Into<String>,
    ) -> Result<Receipt, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let key = idempotency_key.into();

        let account = self.account(user_id).await;
        let mut book = account.book.lock().await;

        if let Some(original) = book.receipts.get(&key) {
            debug!(user = %user_id, key = %key, "Replayed credit");
            return Ok(Receipt { replayed: true, ..original.clone() });
        }

        book.balance
            .get(currency)
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;

        let receipt = self.apply(&account, &mut book, currency, amount, reason, round_id, Some(key.clone()));
        book.receipts.insert(key, receipt.clone());
        Ok(receipt)
    }

    /// Credit external funds. `reference` is the idempotency key (e.g. a payment id).
    pub async fn deposit(
        &self,
        user_id: &UserId,
        amount: Amount,
        currency: Currency,
        reference: impl Into<String>,
    ) -> Result<Receipt, LedgerError> {
        let key = format!("deposit:{}", reference.into());
        self.credit(user_id, amount, currency, EntryReason::Deposit, None, key).await
    }

    /// All entries for a user, oldest first.
    pub async fn entries(&self, user_id: &UserId) -> Vec<LedgerEntry> {
        let account = {
            let accounts = self.accounts.read().await;
            accounts.get(user_id).cloned()
        };
        match account {
            Some(account) => account.book.lock().await.entries.clone(),
            None => Vec::new(),
        }
    }

    /// Check that the user's entries sum to their balance in every currency.
    pub async fn reconcile(&self, user_id: &UserId) -> Result<(), LedgerError> {
        let account = {
            let accounts = self.accounts.read().await;
            accounts.get(user_id).cloned()
        };
        let Some(account) = account else {
            return Ok(());
        };

        let book = account.book.lock().await;
        for currency in Currency::ALL {
            let entries: Amount = book
                .entries
                .iter()
                .filter(|e| e.currency == currency)
                .map(|e| e.delta)
                .sum();
            let balance = book.balance.get(currency);
            if entries != balance {
                return Err(LedgerError::Reconciliation { currency, entries, balance });
            }
        }
        Ok(())
    }

    /// Number of accounts with at least one mutation.
    pub async fn account_count(&self) -> usize {
        self.accounts.read().await.len()
    }

    async fn account(&self, user_id: &UserId) -> Arc<Account> {
        {
            let accounts = self.accounts.read().await;
            if let Some(account) = accounts.get(user_id) {
                return account.clone();
            }
        }
        let mut accounts = self.accounts.write().await;
        accounts
            .entry(user_id.clone())
            .or_insert_with(|| Arc::new(Account::new(user_id.clone())))
            .clone()
    }

    #[allow(clippy::too_many_arguments)]
    fn apply(
        &self,
        account: &Account,
        book: &mut AccountBook,
        currency: Currency,
        delta: Amount,
        reason: EntryReason,
        round_id: Option<RoundId>,
        idempotency_key: Option<String>,
    ) -> Receipt {
        let next = book.balance.get(currency) + delta;
        book.balance.set(currency, next);
        book.balance.version += 1;

        let entry = LedgerEntry {
            user_id: book.balance.user_id.clone(),
            currency,
            delta,
            reason,
            round_id,
            idempotency_key,
            version: book.balance.version,
            timestamp: Utc::now(),
        };
        book.entries.push(entry.clone());

        account.snapshot.send_replace(book.balance.clone());
        // No subscribers is not an error
        let _ = self.events.send(BalanceChange {
            balance: book.balance.clone(),
            entry: entry.clone(),
        });

        Receipt {
            balance: book.balance.clone(),
            entry,
            replayed: false,
        }
    }
}

impl Default for BalanceLedger {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::amount::{parse_amount, AMOUNT_ONE};
    use proptest::prelude::*;

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    fn ton(s: &str) -> Amount {
        parse_amount(s).unwrap()
    }

    #[tokio::test]
    async fn test_deposit_and_debit() {
        let ledger = BalanceLedger::new();
        let alice = user("alice");

        ledger.deposit(&alice, ton("1.00"), Currency::Ton, "tx-1").await.unwrap();
        let receipt = ledger
            .debit(&alice, ton("0.10"), Currency::Ton, EntryReason::Stake, None)
            .await
            .unwrap();

        assert_eq!(receipt.balance.ton, ton("0.90"));
        assert_eq!(receipt.balance.version, 2);
        assert_eq!(receipt.entry.delta, -ton("0.10"));
        assert_eq!(ledger.read(&alice).await.ton, ton("0.90"));
        assert!(ledger.reconcile(&alice).await.is_ok());
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_state_untouched() {
        let ledger = BalanceLedger::new();
        let bob = user("bob");
        ledger.deposit(&bob, ton("0.05"), Currency::Ton, "tx").await.unwrap();

        let result = ledger
            .debit(&bob, ton("0.10"), Currency::Ton, EntryReason::Stake, None)
            .await;
        assert_eq!(
            result,
            Err(LedgerError::InsufficientFunds { needed: ton("0.10"), available: ton("0.05") })
        );

        let balance = ledger.read(&bob).await;
        assert_eq!(balance.ton, ton("0.05"));
        assert_eq!(balance.version, 1);
        assert_eq!(ledger.entries(&bob).await.len(), 1);
    }

    #[tokio::test]
    async fn test_currencies_are_separate() {
        let ledger = BalanceLedger::new();
        let carol = user("carol");
        ledger.deposit(&carol, 50 * AMOUNT_ONE, Currency::Stars, "stars-1").await.unwrap();

        let result = ledger
            .debit(&carol, AMOUNT_ONE, Currency::Ton, EntryReason::Stake, None)
            .await;
        assert!(matches!(result, Err(LedgerError::InsufficientFunds { .. })));
        assert_eq!(ledger.read(&carol).await.stars, 50 * AMOUNT_ONE);
    }

    #[tokio::test]
    async fn test_invalid_amounts_rejected() {
        let ledger = BalanceLedger::new();
        let dave = user("dave");
        assert_eq!(
            ledger.credit(&dave, 0, Currency::Ton, EntryReason::Adjustment, None, "k").await,
            Err(LedgerError::InvalidAmount(0))
        );
        assert_eq!(
            ledger.debit(&dave, -5, Currency::Ton, EntryReason::Stake, None).await,
            Err(LedgerError::InvalidAmount(-5))
        );
        assert_eq!(ledger.account_count().await, 0);
    }

    #[tokio::test]
    async fn test_idempotent_credit() {
        let ledger = BalanceLedger::new();
        let erin = user("erin");

        let first = ledger
            .credit(&erin, ton("0.18"), Currency::Ton, EntryReason::Payout, None, "payout:r1:erin")
            .await
            .unwrap();
        let second = ledger
            .credit(&erin, ton("0.18"), Currency::Ton, EntryReason::Payout, None, "payout:r1:erin")
            .await
            .unwrap();

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.entry, second.entry);
        assert_eq!(ledger.read(&erin).await.ton, ton("0.18"));
        assert_eq!(ledger.entries(&erin).await.len(), 1);
    }

    #[tokio::test]
    async fn test_overflow_rejected() {
        let ledger = BalanceLedger::new();
        let frank = user("frank");
        ledger.credit(&frank, i64::MAX, Currency::Ton, EntryReason::Deposit, None, "a").await.unwrap();
        let result = ledger.credit(&frank, 1, Currency::Ton, EntryReason::Deposit, None, "b").await;
        assert_eq!(result, Err(LedgerError::Overflow));
        assert!(ledger.reconcile(&frank).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_user_reads_zero() {
        let ledger = BalanceLedger::new();
        let balance = ledger.read(&user("ghost")).await;
        assert_eq!(balance, Balance::empty(user("ghost")));
        assert_eq!(ledger.account_count().await, 0);
    }

    #[tokio::test]
    async fn test_change_events_in_order() {
        let ledger = BalanceLedger::new();
        let mut rx = ledger.subscribe();
        let gina = user("gina");

        ledger.deposit(&gina, ton("1"), Currency::Ton, "d").await.unwrap();
        ledger.debit(&gina, ton("0.3"), Currency::Ton, EntryReason::Stake, None).await.unwrap();
        ledger.debit(&gina, ton("0.3"), Currency::Ton, EntryReason::Stake, None).await.unwrap();

        let versions: Vec<u64> = (0..3).map(|_| rx.try_recv().unwrap().balance.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits_never_overdraw() {
        let ledger = Arc::new(BalanceLedger::new());
        let hank = user("hank");
        ledger.deposit(&hank, ton("0.50"), Currency::Ton, "d").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..100 {
            let ledger = ledger.clone();
            let hank = hank.clone();
            handles.push(tokio::spawn(async move {
                ledger.debit(&hank, ton("0.01"), Currency::Ton, EntryReason::Stake, None).await
            }));
        }

        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }

        assert_eq!(ok, 50);
        let balance = ledger.read(&hank).await;
        assert_eq!(balance.ton, 0);
        assert_eq!(balance.version, 51);
        assert!(ledger.reconcile(&hank).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_credits_apply_once() {
        let ledger = Arc::new(BalanceLedger::new());
        let ivy = user("ivy");

        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = ledger.clone();
            let ivy = ivy.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .credit(&ivy, ton("0.18"), Currency::Ton, EntryReason::Payout, None, "payout:x:ivy")
                    .await
            }));
        }
        let receipts: Vec<Receipt> = {
            let mut out = Vec::new();
            for handle in handles {
                out.push(handle.await.unwrap().unwrap());
            }
            out
        };

        assert_eq!(receipts.iter().filter(|r| !r.replayed).count(), 1);
        assert_eq!(ledger.read(&ivy).await.ton, ton("0.18"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reads_are_monotonic_under_writes() {
        let ledger = Arc::new(BalanceLedger::new());
        let jack = user("jack");
        ledger.deposit(&jack, ton("1"), Currency::Ton, "seed").await.unwrap();

        let writer = {
            let ledger = ledger.clone();
            let jack = jack.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    let currency = if i % 2 == 0 { Currency::Ton } else { Currency::Stars };
                    ledger
                        .credit(&jack, 1, currency, EntryReason::Adjustment, None, format!("adj-{}", i))
                        .await
                        .unwrap();
                }
            })
        };

        let mut last = 0;
        while !writer.is_finished() {
            let snapshot = ledger.read(&jack).await;
            assert!(snapshot.version >= last);
            // version 1 is the deposit; each later version adds one unit to one currency
            assert_eq!(
                (snapshot.ton - ton("1")) + snapshot.stars,
                snapshot.version as Amount - 1
            );
            last = snapshot.version;
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Credit(Amount),
        Debit(Amount),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1..1_000_000_000i64).prop_map(Op::Credit),
            (1..1_000_000_000i64).prop_map(Op::Debit),
        ]
    }

    proptest! {
        #[test]
        fn prop_ledger_conservation(ops in proptest::collection::vec(op_strategy(), 1..60)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let ledger = BalanceLedger::new();
                let kim = user("kim");
                let mut expected: Amount = 0;

                for (i, op) in ops.iter().enumerate() {
                    match op {
                        Op::Credit(a) => {
                            ledger
                                .credit(&kim, *a, Currency::Ton, EntryReason::Deposit, None, format!("c{}", i))
                                .await
                                .unwrap();
                            expected += a;
                        }
                        Op::Debit(a) => {
                            let result = ledger.debit(&kim, *a, Currency::Ton, EntryReason::Stake, None).await;
                            if *a <= expected {
                                prop_assert!(result.is_ok());
                                expected -= a;
                            } else {
                                prop_assert!(result.is_err());
                            }
                        }
                    }
                    let balance = ledger.read(&kim).await;
                    prop_assert!(balance.ton >= 0);
                    prop_assert_eq!(balance.ton, expected);
                    prop_assert!(ledger.reconcile(&kim).await.is_ok());
                }
                Ok(())
            })?;
        }
    }
}
