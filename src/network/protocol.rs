//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Messages are JSON text frames tagged by `type`. The two latency-critical
//! commands (bet, cash-out) also have a compact bincode frame.

use serde::{Deserialize, Serialize};

use crate::core::amount::{multiplier_to_float, to_amount, to_float, Amount, Multiplier};
use crate::fair::seed::AuditRecord;
use crate::ledger::balance::{Balance, Currency};
use crate::round::engine::{BetReceipt, CashOutReceipt, RoundEvent};
use crate::round::state::{RoundError, RoundId, RoundSnapshot};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with the server.
    Auth(AuthRequest),

    /// Place a bet on the current round.
    PlaceBet(PlaceBetRequest),

    /// Cash out the open bet.
    CashOut {
        /// Declared user id; must match the session when present.
        #[serde(default, rename = "userId")]
        user_id: Option<String>,
    },

    /// Request the current round snapshot (for reconnection).
    SyncRequest,

    /// Request revealed seed records.
    AuditRequest {
        /// A single nonce, or the whole log when absent.
        #[serde(default)]
        nonce: Option<u64>,
    },

    /// Ping for latency measurement.
    Ping { timestamp: u64 },
}

/// Authentication request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    /// Declared user id.
    pub user_id: String,
    /// JWT from the auth provider. Required when the server has auth configured.
    #[serde(default)]
    pub token: Option<String>,
    /// Client version for compatibility check.
    #[serde(default)]
    pub client_version: String,
}

/// Bet placement request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceBetRequest {
    /// Declared user id; must match the session when present.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Stake in whole currency units (e.g. `0.1` TON).
    pub stake: f64,
    /// Stake currency.
    pub currency: Currency,
}

impl PlaceBetRequest {
    /// Stake as a fixed-point amount.
    pub fn stake_amount(&self) -> Option<Amount> {
        to_amount(self.stake).filter(|a| *a > 0)
    }
}

/// Compact binary command kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Place a bet.
    PlaceBet,
    /// Cash out.
    CashOut,
}

/// Flat binary form of the bet and cash-out commands.
///
/// Tagged enums do not survive bincode, so binary frames use this struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactCommand {
    /// Command.
    pub kind: CommandKind,
    /// Stake in nano-units (ignored for cash-out).
    pub stake: Amount,
    /// Stake currency (ignored for cash-out).
    pub currency: Currency,
}

impl CompactCommand {
    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Expand into the equivalent JSON-protocol message.
    pub fn into_message(self) -> ClientMessage {
        match self.kind {
            CommandKind::PlaceBet => ClientMessage::PlaceBet(PlaceBetRequest {
                user_id: None,
                stake: to_float(self.stake),
                currency: self.currency,
            }),
            CommandKind::CashOut => ClientMessage::CashOut { user_id: None },
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication result.
    AuthResult(AuthResult),

    /// Round lifecycle event.
    Round(RoundEvent),

    /// Full round snapshot (reply to `sync_request`).
    RoundState(RoundSnapshot),

    /// Bet placement result.
    BetResult(BetResult),

    /// Cash-out result.
    CashOutResult(CashOutResult),

    /// Balance push for the session's user.
    Balance(BalanceView),

    /// Revealed seed records.
    Audit {
        /// Records ordered by nonce.
        records: Vec<AuditRecord>,
    },

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown { reason: String },
}

/// Authentication result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResult {
    /// Whether auth succeeded.
    pub success: bool,
    /// Authenticated user id.
    pub user_id: Option<String>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// Balance in display units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceView {
    /// TON.
    pub ton: f64,
    /// Stars.
    pub stars: f64,
    /// Ledger version.
    pub version: u64,
}

impl From<&Balance> for BalanceView {
    fn from(balance: &Balance) -> Self {
        Self {
            ton: to_float(balance.ton),
            stars: to_float(balance.stars),
            version: balance.version,
        }
    }
}

/// Bet placement result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetResult {
    /// Whether the bet was taken.
    pub accepted: bool,
    /// Round the bet belongs to.
    pub round_id: Option<RoundId>,
    /// Rejection reason.
    pub reason: Option<ErrorCode>,
    /// Balance after the stake debit.
    pub balance: Option<BalanceView>,
}

impl BetResult {
    /// Build from an engine reply.
    pub fn from_result(result: &Result<BetReceipt, RoundError>) -> Self {
        match result {
            Ok(receipt) => Self {
                accepted: true,
                round_id: Some(receipt.round_id),
                reason: None,
                balance: Some(BalanceView::from(&receipt.balance)),
            },
            Err(e) => Self {
                accepted: false,
                round_id: None,
                reason: Some(ErrorCode::from(e)),
                balance: None,
            },
        }
    }
}

/// Cash-out result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashOutResult {
    /// Whether the cash-out was locked in.
    pub accepted: bool,
    /// Locked multiplier in hundredths.
    pub multiplier: Option<Multiplier>,
    /// Locked multiplier for display.
    pub multiplier_display: Option<f64>,
    /// Amount credited at settlement.
    pub payout: Option<f64>,
    /// Rejection reason.
    pub reason: Option<ErrorCode>,
}

impl CashOutResult {
    /// Build from an engine reply.
    pub fn from_result(result: &Result<CashOutReceipt, RoundError>) -> Self {
        match result {
            Ok(receipt) => Self {
                accepted: true,
                multiplier: Some(receipt.multiplier),
                multiplier_display: Some(multiplier_to_float(receipt.multiplier)),
                payout: Some(to_float(receipt.payout)),
                reason: None,
            },
            Err(e) => Self {
                accepted: false,
                multiplier: None,
                multiplier_display: None,
                payout: None,
                reason: Some(ErrorCode::from(e)),
            },
        }
    }
}

/// Server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// Not authenticated.
    NotAuthenticated,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Declared user id differs from the authenticated one.
    UserMismatch,
    /// Invalid input.
    InvalidInput,
    /// Balance too low for the stake.
    InsufficientFunds,
    /// Betting window closed.
    BettingClosed,
    /// Cash-out after the crash.
    TooLate,
    /// Second bet in the same round.
    DuplicateBet,
    /// No bet to cash out.
    NoOpenBet,
    /// Bet already cashed out.
    AlreadyCashedOut,
    /// Round not running yet.
    NotRunning,
    /// Stake not positive or not representable.
    InvalidStake,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

impl From<&RoundError> for ErrorCode {
    fn from(err: &RoundError) -> Self {
        use crate::ledger::book::LedgerError;
        match err {
            RoundError::BettingClosed => ErrorCode::BettingClosed,
            RoundError::TooLate => ErrorCode::TooLate,
            RoundError::DuplicateBet => ErrorCode::DuplicateBet,
            RoundError::NoOpenBet => ErrorCode::NoOpenBet,
            RoundError::AlreadyCashedOut => ErrorCode::AlreadyCashedOut,
            RoundError::NotRunning => ErrorCode::NotRunning,
            RoundError::InvalidStake => ErrorCode::InvalidStake,
            RoundError::Ledger(LedgerError::InsufficientFunds { .. }) => ErrorCode::InsufficientFunds,
            RoundError::Ledger(LedgerError::InvalidAmount(_)) => ErrorCode::InvalidStake,
            RoundError::EngineUnavailable => ErrorCode::ServerOverloaded,
            RoundError::InvalidTransition(_) | RoundError::PayoutOverflow(_) | RoundError::Ledger(_) => {
                ErrorCode::InternalError
            }
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Shorthand for an error reply.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError { code, message: message.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::amount::AMOUNT_ONE;
    use crate::ledger::balance::UserId;
    use crate::ledger::book::LedgerError;

    #[test]
    fn test_place_bet_from_json() {
        let json = r#"{"type":"place_bet","userId":"42","stake":0.1,"currency":"ton"}"#;
        let parsed = ClientMessage::from_json(json).unwrap();

        if let ClientMessage::PlaceBet(req) = parsed {
            assert_eq!(req.user_id.as_deref(), Some("42"));
            assert_eq!(req.stake_amount(), Some(100_000_000));
            assert_eq!(req.currency, Currency::Ton);
        } else {
            panic!("Wrong message type");
        }
    }

    #[test]
    fn test_non_positive_stake_rejected() {
        let req = PlaceBetRequest { user_id: None, stake: 0.0, currency: Currency::Stars };
        assert_eq!(req.stake_amount(), None);
        let req = PlaceBetRequest { user_id: None, stake: f64::NAN, currency: Currency::Stars };
        assert_eq!(req.stake_amount(), None);
    }

    #[test]
    fn test_client_messages_parse() {
        let cases = [
            r#"{"type":"auth","userId":"7","token":"a.b.c"}"#,
            r#"{"type":"cash_out"}"#,
            r#"{"type":"cash_out","userId":"7"}"#,
            r#"{"type":"sync_request"}"#,
            r#"{"type":"audit_request","nonce":3}"#,
            r#"{"type":"audit_request"}"#,
            r#"{"type":"ping","timestamp":1}"#,
        ];
        for case in cases {
            assert!(ClientMessage::from_json(case).is_ok(), "failed: {}", case);
        }
    }

    #[test]
    fn test_compact_command_binary() {
        let command = CompactCommand {
            kind: CommandKind::PlaceBet,
            stake: AMOUNT_ONE / 4,
            currency: Currency::Ton,
        };

        let bytes = command.to_bytes().unwrap();
        assert_eq!(CompactCommand::from_bytes(&bytes).unwrap(), command);

        match command.into_message() {
            ClientMessage::PlaceBet(req) => assert_eq!(req.stake_amount(), Some(AMOUNT_ONE / 4)),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_bet_rejection_carries_reason() {
        let result: Result<BetReceipt, RoundError> =
            Err(RoundError::Ledger(LedgerError::InsufficientFunds { needed: 10, available: 5 }));
        let msg = ServerMessage::BetResult(BetResult::from_result(&result));
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"bet_result\""));
        assert!(json.contains("\"reason\":\"insufficient_funds\""));
        assert!(json.contains("\"accepted\":false"));
    }

    #[test]
    fn test_cash_out_result_display() {
        let receipt = CashOutReceipt {
            round_id: RoundId::nil(),
            multiplier: 180,
            payout: 180_000_000,
        };
        let result = CashOutResult::from_result(&Ok(receipt));
        assert_eq!(result.multiplier_display, Some(1.8));
        assert_eq!(result.payout, Some(0.18));
    }

    #[test]
    fn test_round_event_nested_tag() {
        let msg = ServerMessage::Round(RoundEvent::CashedOut {
            round_id: RoundId::nil(),
            user_id: UserId::new("9"),
            multiplier: 150,
            payout: 15,
        });
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "round");
        assert_eq!(value["event"], "cashed_out");
        assert_eq!(value["userId"], "9");
    }

    #[test]
    fn test_error_codes() {
        let msg = ServerMessage::error(ErrorCode::AuthFailed, "Invalid token");
        let json = msg.to_json().unwrap();
        assert!(json.contains("auth_failed"));
        assert_eq!(ErrorCode::from(&RoundError::TooLate), ErrorCode::TooLate);
        assert_eq!(ErrorCode::from(&RoundError::BettingClosed), ErrorCode::BettingClosed);
        assert_eq!(ErrorCode::from(&RoundError::DuplicateBet), ErrorCode::DuplicateBet);
    }
}
