//! Core types and traits for FundFlow.
//!
//! This crate provides the `StorageBackend` trait that pluggable backends
//! implement, the `Transaction` guard that brackets a unit of work, and the
//! two services built on top of them: `AccountStore` and `Ledger`.

pub mod accounts;
pub mod error;
pub mod ledger;
pub mod models;
pub mod storage;
pub mod transaction;

// Re-export key types at crate root for convenience
pub use accounts::AccountStore;
pub use error::LedgerError;
pub use ledger::Ledger;
pub use models::{Account, AccountId, TransferId, TransferRecord};
pub use models::write::{AppendTransferCommand, CreateAccountCommand, UpdateAccountCommand};
pub use storage::{StorageBackend, StorageError, StorageTransaction, TransactionId};
pub use transaction::Transaction;
