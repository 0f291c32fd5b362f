//! Balance Types
//!
//! Per-user balance in both supported currencies, versioned on every mutation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::amount::Amount;

/// User identifier (Telegram user id or auth subject).
///
/// Implements Ord for BTreeMap ordering.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Create from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Supported currencies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Currency {
    /// Toncoin.
    Ton,
    /// Telegram Stars.
    Stars,
}

impl Currency {
    /// All currencies, in a fixed order.
    pub const ALL: [Currency; 2] = [Currency::Ton, Currency::Stars];
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Currency::Ton => f.write_str("ton"),
            Currency::Stars => f.write_str("stars"),
        }
    }
}

/// A user's balance at one version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Owner.
    pub user_id: UserId,
    /// TON balance (nano-units).
    pub ton: Amount,
    /// Stars balance (nano-units).
    pub stars: Amount,
    /// Incremented on every mutation.
    pub version: u64,
}

impl Balance {
    /// Zero balance at version 0.
    pub fn empty(user_id: UserId) -> Self {
        Self { user_id, ton: 0, stars: 0, version: 0 }
    }

    /// Amount held in `currency`.
    pub fn get(&self, currency: Currency) -> Amount {
        match currency {
            Currency::Ton => self.ton,
            Currency::Stars => self.stars,
        }
    }

    pub(crate) fn set(&mut self, currency: Currency, amount: Amount) {
        match currency {
            Currency::Ton => self.ton = amount,
            Currency::Stars => self.stars = amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_accessors() {
        let mut balance = Balance::empty(UserId::new("42"));
        balance.set(Currency::Stars, 7);
        assert_eq!(balance.get(Currency::Stars), 7);
        assert_eq!(balance.get(Currency::Ton), 0);
        assert_eq!(balance.version, 0);
    }

    #[test]
    fn test_currency_wire_names() {
        assert_eq!(serde_json::to_string(&Currency::Ton).unwrap(), "\"ton\"");
        assert_eq!(serde_json::from_str::<Currency>("\"stars\"").unwrap(), Currency::Stars);
        assert_eq!(serde_json::to_string(&UserId::new("777")).unwrap(), "\"777\"");
    }
}
