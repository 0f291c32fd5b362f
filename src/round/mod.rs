//! Round Lifecycle
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         ROUND                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  state.rs   - Round state machine, bets, snapshots          │
//! │  engine.rs  - Coordinating task, intents, timers, payouts   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod state;

pub use engine::{
    BetReceipt, CashOutReceipt, EngineConfig, EngineError, RoundEngine, RoundEvent, RoundHandle,
};
pub use state::{
    Bet, BetOutcome, Payout, Round, RoundCommitment, RoundError, RoundId, RoundSnapshot, RoundState,
};
