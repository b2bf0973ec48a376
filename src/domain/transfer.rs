use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TokenAmount;

/// Store-assigned and strictly increasing in insertion order.
pub type TransferId = i64;

/// An entry in the append-only transfer history.
/// Records are written once, inside the transaction that moved the funds, and never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: TransferId,
    /// Debited wallet
    pub from_address: String,
    /// Credited wallet (created by the transfer if it did not exist)
    pub to_address: String,
    /// Always positive
    pub amount: TokenAmount,
    pub created_at: DateTime<Utc>,
}

impl TransferRecord {
    pub fn involves(&self, address: &str) -> bool {
        self.from_address == address || self.to_address == address
    }

    pub fn is_self_transfer(&self) -> bool {
        self.from_address == self.to_address
    }
}
