use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TokenAmount;

/// Address of the wallet created at bootstrap.
pub const SEED_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Balance the seed wallet starts with.
pub const SEED_BALANCE: u64 = 1_000_000;

/// A wallet is keyed by an opaque, case-sensitive address.
/// The address format is not validated beyond being non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub address: String,
    pub balance: TokenAmount,
    pub created_at: DateTime<Utc>,
    /// Touched on every balance mutation
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(address: impl Into<String>, balance: TokenAmount) -> Self {
        let now = Utc::now();
        Self {
            address: address.into(),
            balance,
            created_at: now,
            updated_at: now,
        }
    }

    /// The bootstrap wallet holding the initial supply.
    pub fn seed() -> Self {
        Self::new(SEED_ADDRESS, TokenAmount::from(SEED_BALANCE))
    }
}
