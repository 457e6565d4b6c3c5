use std::sync::Arc;

use rust_decimal::Decimal;

use crate::{
    error::LedgerError,
    models::{
        write::{CreateAccountCommand, UpdateAccountCommand},
        Account, AccountId,
    },
    storage::StorageBackend,
    transaction::Transaction,
};

/// Keyed account storage. Holds no transfer logic.
///
/// Each public call runs in its own storage transaction, so it takes the same
/// row protection as a transfer touching the account.
#[derive(Clone)]
pub struct AccountStore {
    storage: Arc<dyn StorageBackend>,
}

impl AccountStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub fn create(&self, name: &str, initial_balance: Decimal) -> Result<Account, LedgerError> {
        ensure_non_negative("initial balance", initial_balance)?;
        let command = CreateAccountCommand {
            name: name.to_string(),
            balance: initial_balance,
        };
        let account = Transaction::run(self.storage(), |tx| {
            tx.insert_account(&command).map_err(LedgerError::from)
        })?;
        tracing::info!(account_id = %account.id, balance = %account.balance, "Account created");
        Ok(account)
    }

    pub fn get(&self, id: AccountId) -> Result<Account, LedgerError> {
        Transaction::run(self.storage(), |tx| tx.get_account(id).map_err(LedgerError::from))
    }

    pub fn list(&self) -> Result<Vec<Account>, LedgerError> {
        Transaction::run(self.storage(), |tx| tx.list_accounts().map_err(LedgerError::from))
    }

    /// Replaces the mutable fields of an account.
    pub fn update(&self, id: AccountId, name: &str, balance: Decimal) -> Result<Account, LedgerError> {
        ensure_non_negative("balance", balance)?;
        let command = UpdateAccountCommand {
            id,
            name: name.to_string(),
            balance,
        };
        let account = Transaction::run(self.storage(), |tx| {
            tx.update_account(&command).map_err(LedgerError::from)
        })?;
        tracing::info!(account_id = %id, balance = %account.balance, "Account updated");
        Ok(account)
    }

    /// Removes an account and returns its last state. Transfer records that
    /// reference it are left alone.
    pub fn delete(&self, id: AccountId) -> Result<Account, LedgerError> {
        let account = Transaction::run(self.storage(), |tx| {
            tx.delete_account(id).map_err(LedgerError::from)
        })?;
        tracing::info!(account_id = %id, "Account deleted");
        Ok(account)
    }

    /// Applies `balance += delta` as part of the caller's transaction.
    pub(crate) fn adjust_balance(
        &self,
        tx: &mut Transaction<'_>,
        id: AccountId,
        delta: Decimal,
    ) -> Result<Account, LedgerError> {
        tx.adjust_balance(id, delta).map_err(LedgerError::from)
    }

    pub(crate) fn storage(&self) -> &dyn StorageBackend {
        self.storage.as_ref()
    }
}

fn ensure_non_negative(field: &str, value: Decimal) -> Result<(), LedgerError> {
    if value < Decimal::ZERO {
        return Err(LedgerError::InvalidArgument(format!(
            "{} must not be negative, got {}",
            field, value
        )));
    }
    Ok(())
}
