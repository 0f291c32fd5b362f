//! Balance Ledger
//!
//! Authoritative balances, the append-only entry log, and change events.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        LEDGER                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  balance.rs - UserId, Currency, versioned Balance           │
//! │  entry.rs   - LedgerEntry, BalanceChange, Receipt           │
//! │  book.rs    - BalanceLedger: debit, credit, read, reconcile │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod balance;
pub mod book;
pub mod entry;

pub use balance::{Balance, Currency, UserId};
pub use book::{BalanceLedger, LedgerError};
pub use entry::{BalanceChange, EntryReason, LedgerEntry, Receipt};
