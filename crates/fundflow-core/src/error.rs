use thiserror::Error;

use crate::{models::AccountId, storage::StorageError};

/// Outcome of a failed `AccountStore` or `Ledger` call.
///
/// Every variant except `Storage` is a business outcome that leaves state
/// untouched. `Storage` means the backend failed and is never swallowed.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("account not found: {0}")]
    NotFound(AccountId),
    #[error("insufficient balance in account {0}")]
    InsufficientFunds(AccountId),
    #[error("storage failure: {0}")]
    Storage(StorageError),
}

impl LedgerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, LedgerError::Storage(_))
    }
}

impl From<StorageError> for LedgerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::AccountNotFound(id) => LedgerError::NotFound(id),
            StorageError::InsufficientFunds(id) => LedgerError::InsufficientFunds(id),
            StorageError::BalanceOverflow(id) => {
                LedgerError::InvalidArgument(format!("balance of account {} would overflow", id))
            }
            other => LedgerError::Storage(other),
        }
    }
}
