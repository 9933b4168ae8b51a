use thiserror::Error;

use crate::domain::{Coins, MerchId, UserId};

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("Merch not found: {0}")]
    MerchNotFound(MerchId),

    #[error("Insufficient funds for user {user_id}: balance {balance}, required {required}")]
    InsufficientFunds {
        user_id: UserId,
        balance: Coins,
        required: Coins,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Cannot transfer coins from user {0} to themselves")]
    SelfTransfer(UserId),

    #[error("Operation canceled")]
    Canceled,

    #[error("Store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Coarse failure classes for callers that map errors onto responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InsufficientFunds,
    InvalidInput,
    Store,
    Canceled,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::UserNotFound(_) | LedgerError::MerchNotFound(_) => ErrorKind::NotFound,
            LedgerError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            LedgerError::InvalidAmount(_) | LedgerError::SelfTransfer(_) => {
                ErrorKind::InvalidInput
            }
            LedgerError::Store(_) => ErrorKind::Store,
            LedgerError::Canceled => ErrorKind::Canceled,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}
