use std::fmt::Display;

use rust_decimal::Decimal;

use crate::{
    models::{
        write::{AppendTransferCommand, CreateAccountCommand, UpdateAccountCommand},
        Account, AccountId, TransferRecord,
    },
    storage::{StorageBackend, StorageError, StorageTransaction, TransactionId},
};

/// Scoped unit of work over a backend transaction.
///
/// The guard must be finished with [`Transaction::commit`] or
/// [`Transaction::rollback`]. If it is dropped first, including while
/// unwinding from a panic, the work is rolled back.
pub struct Transaction<'a> {
    id: TransactionId,
    inner: Option<Box<dyn StorageTransaction + 'a>>,
}

impl<'a> Transaction<'a> {
    pub fn begin(storage: &'a dyn StorageBackend) -> Result<Self, StorageError> {
        let inner = storage.begin()?;
        Ok(Self {
            id: inner.id(),
            inner: Some(inner),
        })
    }

    /// Runs `f` inside a fresh transaction, committing on `Ok` and rolling
    /// back on `Err`.
    ///
    /// When the rollback itself fails the storage error is returned in place
    /// of the error from `f`, which is logged.
    pub fn run<T, E, F>(storage: &'a dyn StorageBackend, f: F) -> Result<T, E>
    where
        E: From<StorageError> + Display,
        F: FnOnce(&mut Transaction<'a>) -> Result<T, E>,
    {
        let mut tx = Transaction::begin(storage)?;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                let tx_id = tx.id;
                if let Err(rollback_err) = tx.rollback() {
                    tracing::error!(tx_id, error = %err, rollback_error = %rollback_err, "Rollback failed");
                    return Err(rollback_err.into());
                }
                Err(err)
            }
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn commit(mut self) -> Result<(), StorageError> {
        self.inner.take().ok_or(StorageError::NoActiveTransaction)?.commit()
    }

    pub fn rollback(mut self) -> Result<(), StorageError> {
        self.inner.take().ok_or(StorageError::NoActiveTransaction)?.rollback()
    }

    fn active(&mut self) -> Result<&mut (dyn StorageTransaction + 'a), StorageError> {
        self.inner.as_deref_mut().ok_or(StorageError::NoActiveTransaction)
    }

    pub fn insert_account(&mut self, command: &CreateAccountCommand) -> Result<Account, StorageError> {
        self.active()?.insert_account(command)
    }

    pub fn get_account(&mut self, id: AccountId) -> Result<Account, StorageError> {
        self.active()?.get_account(id)
    }

    pub fn list_accounts(&mut self) -> Result<Vec<Account>, StorageError> {
        self.active()?.list_accounts()
    }

    pub fn update_account(&mut self, command: &UpdateAccountCommand) -> Result<Account, StorageError> {
        self.active()?.update_account(command)
    }

    pub fn delete_account(&mut self, id: AccountId) -> Result<Account, StorageError> {
        self.active()?.delete_account(id)
    }

    pub fn adjust_balance(&mut self, id: AccountId, delta: Decimal) -> Result<Account, StorageError> {
        self.active()?.adjust_balance(id, delta)
    }

    pub fn append_transfer(&mut self, command: &AppendTransferCommand) -> Result<TransferRecord, StorageError> {
        self.active()?.append_transfer(command)
    }

    pub fn list_transfers(&mut self) -> Result<Vec<TransferRecord>, StorageError> {
        self.active()?.list_transfers()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            tracing::debug!(tx_id = self.id, "Rolling back unfinished transaction");
            if let Err(e) = inner.rollback() {
                tracing::error!(tx_id = self.id, error = %e, "Rollback on drop failed");
            }
        }
    }
}
