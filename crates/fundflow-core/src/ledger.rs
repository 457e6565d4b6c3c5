use rust_decimal::Decimal;

use crate::{
    accounts::AccountStore,
    error::LedgerError,
    models::{write::AppendTransferCommand, AccountId, TransferRecord},
    transaction::Transaction,
};

/// Moves funds between accounts and keeps the transfer log.
///
/// The ledger holds no locks and no cached balances. Every transfer re-reads
/// state inside its own storage transaction and relies on the backend to
/// serialize writers to the same account.
pub struct Ledger {
    accounts: AccountStore,
}

impl Ledger {
    pub fn new(accounts: AccountStore) -> Self {
        Self { accounts }
    }

    pub fn accounts(&self) -> &AccountStore {
        &self.accounts
    }

    /// Debits `sender_id`, credits `receiver_id` and logs the transfer as one
    /// unit of work. On any error nothing is applied.
    pub fn transfer(
        &self,
        sender_id: AccountId,
        receiver_id: AccountId,
        amount: Decimal,
    ) -> Result<TransferRecord, LedgerError> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidArgument(format!(
                "transfer amount must be positive, got {}",
                amount
            )));
        }
        if sender_id == receiver_id {
            return Err(LedgerError::InvalidArgument(format!(
                "cannot transfer from account {} to itself",
                sender_id
            )));
        }

        let command = AppendTransferCommand {
            sender_id,
            receiver_id,
            amount,
        };
        let result = Transaction::run(self.accounts.storage(), |tx| {
            self.accounts.adjust_balance(tx, sender_id, -amount)?;
            self.accounts.adjust_balance(tx, receiver_id, amount)?;
            tx.append_transfer(&command).map_err(LedgerError::from)
        });

        match &result {
            Ok(record) => tracing::info!(
                transfer_id = record.id,
                %sender_id,
                %receiver_id,
                %amount,
                "Transfer committed"
            ),
            Err(e) if e.is_fatal() => tracing::error!(%sender_id, %receiver_id, %amount, error = %e, "Transfer failed"),
            Err(e) => tracing::info!(%sender_id, %receiver_id, %amount, error = %e, "Transfer rejected"),
        }
        result
    }

    /// All committed transfers, oldest first.
    pub fn list_transfers(&self) -> Result<Vec<TransferRecord>, LedgerError> {
        Transaction::run(self.accounts.storage(), |tx| {
            tx.list_transfers().map_err(LedgerError::from)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::transaction::tests::{Outcome, RecordingBackend};
    use rust_decimal_macros::dec;

    fn ledger() -> (Arc<RecordingBackend>, Ledger) {
        let backend = Arc::new(RecordingBackend::default());
        let ledger = Ledger::new(AccountStore::new(backend.clone()));
        (backend, ledger)
    }

    #[test]
    fn test_non_positive_amount_is_rejected() {
        let (backend, ledger) = ledger();

        for amount in [Decimal::ZERO, dec!(-10)] {
            let result = ledger.transfer(AccountId(1), AccountId(2), amount);
            assert!(matches!(result, Err(LedgerError::InvalidArgument(_))));
        }
        assert!(backend.outcomes().is_empty(), "No transaction should be opened");
    }

    #[test]
    fn test_self_transfer_is_rejected() {
        let (backend, ledger) = ledger();

        let result = ledger.transfer(AccountId(1), AccountId(1), dec!(5));
        assert!(matches!(result, Err(LedgerError::InvalidArgument(_))));
        assert!(backend.outcomes().is_empty(), "No transaction should be opened");
    }

    #[test]
    fn test_rejected_debit_rolls_back() {
        let (backend, ledger) = ledger();

        let result = ledger.transfer(AccountId(1), AccountId(2), dec!(5));
        assert!(matches!(result, Err(LedgerError::InsufficientFunds(AccountId(1)))));
        assert_eq!(backend.outcomes(), vec![Outcome::RolledBack]);
    }
}
