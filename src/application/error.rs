use thiserror::Error;

use crate::domain::{ParseAmountError, TokenAmount};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("invalid amount: {input:?} ({reason})")]
    InvalidAmount {
        input: String,
        reason: ParseAmountError,
    },

    #[error("sender wallet does not exist: {0}")]
    SenderNotFound(String),

    #[error("insufficient balance in wallet {address}: balance {balance}, required {required}")]
    InsufficientBalance {
        address: String,
        balance: TokenAmount,
        required: TokenAmount,
    },

    #[error("wallet not found: {0}")]
    WalletNotFound(String),

    /// Connectivity, constraint violations, lock contention and deadline expiry.
    #[error("store failure: {0:#}")]
    StoreFailure(#[from] anyhow::Error),
}

/// Tag of a [`LedgerError`], for callers that branch on the failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidAmount,
    SenderNotFound,
    InsufficientBalance,
    WalletNotFound,
    StoreFailure,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidAmount { .. } => ErrorKind::InvalidAmount,
            LedgerError::SenderNotFound(_) => ErrorKind::SenderNotFound,
            LedgerError::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            LedgerError::WalletNotFound(_) => ErrorKind::WalletNotFound,
            LedgerError::StoreFailure(_) => ErrorKind::StoreFailure,
        }
    }

    /// True if the call was abandoned because its deadline passed, either on the
    /// client or through the store's statement timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            LedgerError::StoreFailure(err) => err.chain().any(|cause| {
                cause.is::<tokio::time::error::Elapsed>()
                    || cause
                        .downcast_ref::<sqlx::Error>()
                        .is_some_and(is_statement_timeout)
            }),
            _ => false,
        }
    }
}

/// `query_canceled`, raised by PostgreSQL when `statement_timeout` expires.
const QUERY_CANCELED: &str = "57014";

fn is_statement_timeout(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(QUERY_CANCELED),
        _ => false,
    }
}
