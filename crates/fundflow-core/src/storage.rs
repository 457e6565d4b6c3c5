use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{
    write::{AppendTransferCommand, CreateAccountCommand, UpdateAccountCommand},
    Account, AccountId, TransferRecord,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    Other(String),
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),
    #[error("insufficient funds in account {0}")]
    InsufficientFunds(AccountId),
    #[error("balance of account {0} would overflow")]
    BalanceOverflow(AccountId),
    #[error("timed out waiting for the lock on account {0}")]
    LockTimeout(AccountId),
    #[error("transaction conflict: {0}")]
    Conflict(String),
    #[error("no active transaction")]
    NoActiveTransaction,
}

pub type TransactionId = u64;

/// A storage engine that can open units of work.
///
/// Implementations must give every transaction read-committed visibility and
/// serialize writers to the same account row.
pub trait StorageBackend: Send + Sync {
    fn begin(&self) -> Result<Box<dyn StorageTransaction + '_>, StorageError>;
}

/// One open unit of work against a [`StorageBackend`].
///
/// Writes become visible to other transactions only on `commit`. Dropping a
/// transaction that was neither committed nor rolled back must roll it back.
pub trait StorageTransaction {
    fn id(&self) -> TransactionId;

    fn insert_account(&mut self, command: &CreateAccountCommand) -> Result<Account, StorageError>;
    fn get_account(&mut self, id: AccountId) -> Result<Account, StorageError>;
    fn list_accounts(&mut self) -> Result<Vec<Account>, StorageError>;
    fn update_account(&mut self, command: &UpdateAccountCommand) -> Result<Account, StorageError>;
    fn delete_account(&mut self, id: AccountId) -> Result<Account, StorageError>;

    /// Applies `balance += delta`, failing with `InsufficientFunds` rather
    /// than letting the balance drop below zero.
    fn adjust_balance(&mut self, id: AccountId, delta: Decimal) -> Result<Account, StorageError>;

    fn append_transfer(&mut self, command: &AppendTransferCommand) -> Result<TransferRecord, StorageError>;
    fn list_transfers(&mut self) -> Result<Vec<TransferRecord>, StorageError>;

    fn commit(self: Box<Self>) -> Result<(), StorageError>;
    fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}
