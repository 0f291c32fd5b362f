//! # Crash Wager Server
//!
//! Provably-fair crash game: committed seeds, a timer-driven round engine
//! and a per-user balance ledger with live updates.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CRASH WAGER SERVER                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Integer money, digests, entropy          │
//! │  ├── amount.rs   - Nano-unit amounts, multipliers           │
//! │  ├── hash.rs     - SHA-256 / HMAC helpers, record hashing   │
//! │  └── entropy.rs  - Seed entropy source                      │
//! │                                                             │
//! │  fair/           - Provably fair randomness                 │
//! │  ├── seed.rs     - SeedManager commit / reveal / audit      │
//! │  ├── crash.rs    - Crash point derivation                   │
//! │  ├── clock.rs    - Multiplier clock                         │
//! │  └── verify.rs   - Public verification                      │
//! │                                                             │
//! │  ledger/         - Balances                                 │
//! │  ├── book.rs     - BalanceLedger debit / credit / events    │
//! │  ├── balance.rs  - Users, currencies, balances              │
//! │  └── entry.rs    - Ledger entries, receipts                 │
//! │                                                             │
//! │  round/          - Round lifecycle                          │
//! │  ├── state.rs    - Round state machine                      │
//! │  └── engine.rs   - RoundEngine coordinating task            │
//! │                                                             │
//! │  network/        - WebSocket, HTTP, live streams            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Money Guarantee
//!
//! Amounts are `i64` nano-units and multipliers `u64` hundredths. Payouts
//! are `floor(stake * multiplier / 100)`; no float ever decides a balance.
//! Floats appear only at the JSON edge.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod fair;
pub mod ledger;
pub mod network;
pub mod round;

// Re-export commonly used types
pub use core::amount::{Amount, Multiplier, AMOUNT_ONE, MULTIPLIER_ONE};
pub use fair::{CrashConfig, MultiplierClock, SeedManager};
pub use ledger::{BalanceLedger, Currency, UserId};
pub use network::{GameServer, LiveUpdatePublisher, ServerConfig};
pub use round::{EngineConfig, RoundEngine, RoundHandle, RoundId, RoundState};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
