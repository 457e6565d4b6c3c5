use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError, RwLock,
    },
    time::Duration,
};

use rust_decimal::Decimal;

use fundflow_core::{
    Account, AccountId, AppendTransferCommand, CreateAccountCommand, StorageBackend, StorageError,
    StorageTransaction, TransactionId, TransferRecord, UpdateAccountCommand,
};

mod locks;

use locks::RowLocks;

/// How long a transaction waits for another one to release an account.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-local storage.
///
/// Committed state lives behind an `RwLock`. Transactions buffer their writes
/// and publish them in one step on commit, so readers only ever see committed
/// balances. Writers to the same account are serialized by row locks.
pub struct InMemoryStorage {
    accounts: RwLock<BTreeMap<AccountId, Account>>,
    transfers: Mutex<Vec<TransferRecord>>,
    row_locks: RowLocks,
    lock_timeout: Duration,
    account_sequence: AtomicI64,
    tx_counter: AtomicU64,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            accounts: RwLock::new(BTreeMap::new()),
            transfers: Mutex::new(Vec::new()),
            row_locks: RowLocks::new(),
            lock_timeout,
            account_sequence: AtomicI64::new(1),
            tx_counter: AtomicU64::new(1),
        }
    }

    fn committed(&self, id: AccountId) -> Option<Account> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

impl StorageBackend for InMemoryStorage {
    fn begin(&self) -> Result<Box<dyn StorageTransaction + '_>, StorageError> {
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, "Transaction started");
        Ok(Box::new(MemoryTransaction {
            storage: self,
            tx_id,
            locked: BTreeSet::new(),
            writes: BTreeMap::new(),
            log: None,
            appended: Vec::new(),
            finished: false,
        }))
    }
}

struct MemoryTransaction<'a> {
    storage: &'a InMemoryStorage,
    tx_id: TransactionId,
    locked: BTreeSet<AccountId>,
    // `None` marks a pending delete
    writes: BTreeMap<AccountId, Option<Account>>,
    // Held from the first append until the transaction ends, so log order
    // matches commit order.
    log: Option<MutexGuard<'a, Vec<TransferRecord>>>,
    appended: Vec<TransferRecord>,
    finished: bool,
}

impl<'a> MemoryTransaction<'a> {
    fn lock_row(&mut self, id: AccountId) -> Result<(), StorageError> {
        if !self.locked.contains(&id) {
            self.storage
                .row_locks
                .acquire(self.tx_id, id, self.storage.lock_timeout)?;
            self.locked.insert(id);
        }
        Ok(())
    }

    fn read(&self, id: AccountId) -> Option<Account> {
        match self.writes.get(&id) {
            Some(pending) => pending.clone(),
            None => self.storage.committed(id),
        }
    }

    fn read_locked(&mut self, id: AccountId) -> Result<Account, StorageError> {
        self.lock_row(id)?;
        self.read(id).ok_or(StorageError::AccountNotFound(id))
    }

    fn log(&mut self) -> &mut MutexGuard<'a, Vec<TransferRecord>> {
        let storage = self.storage;
        self.log.get_or_insert_with(|| {
            storage.transfers.lock().unwrap_or_else(PoisonError::into_inner)
        })
    }
}

impl StorageTransaction for MemoryTransaction<'_> {
    fn id(&self) -> TransactionId {
        self.tx_id
    }

    fn insert_account(&mut self, command: &CreateAccountCommand) -> Result<Account, StorageError> {
        let id = AccountId(self.storage.account_sequence.fetch_add(1, Ordering::SeqCst));
        self.lock_row(id)?;
        let account = Account {
            id,
            name: command.name.clone(),
            balance: command.balance,
        };
        self.writes.insert(id, Some(account.clone()));
        Ok(account)
    }

    fn get_account(&mut self, id: AccountId) -> Result<Account, StorageError> {
        self.read(id).ok_or(StorageError::AccountNotFound(id))
    }

    fn list_accounts(&mut self) -> Result<Vec<Account>, StorageError> {
        let mut snapshot = self
            .storage
            .accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (id, pending) in &self.writes {
            match pending {
                Some(account) => {
                    snapshot.insert(*id, account.clone());
                }
                None => {
                    snapshot.remove(id);
                }
            }
        }
        Ok(snapshot.into_values().collect())
    }

    fn update_account(&mut self, command: &UpdateAccountCommand) -> Result<Account, StorageError> {
        let mut account = self.read_locked(command.id)?;
        account.name = command.name.clone();
        account.balance = command.balance;
        self.writes.insert(command.id, Some(account.clone()));
        Ok(account)
    }

    fn delete_account(&mut self, id: AccountId) -> Result<Account, StorageError> {
        let account = self.read_locked(id)?;
        self.writes.insert(id, None);
        Ok(account)
    }

    fn adjust_balance(&mut self, id: AccountId, delta: Decimal) -> Result<Account, StorageError> {
        let mut account = self.read_locked(id)?;
        let balance = account
            .balance
            .checked_add(delta)
            .ok_or(StorageError::BalanceOverflow(id))?;
        if balance < Decimal::ZERO {
            return Err(StorageError::InsufficientFunds(id));
        }
        account.balance = balance;
        self.writes.insert(id, Some(account.clone()));
        Ok(account)
    }

    fn append_transfer(&mut self, command: &AppendTransferCommand) -> Result<TransferRecord, StorageError> {
        let (committed_len, committed_last) = {
            let log = self.log();
            (log.len(), log.last().map(|r| r.timestamp))
        };
        let previous = self.appended.last().map(|r| r.timestamp).or(committed_last);
        let id = i64::try_from(committed_len + self.appended.len() + 1)
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let record = TransferRecord {
            id,
            sender_id: command.sender_id,
            receiver_id: command.receiver_id,
            amount: command.amount,
            timestamp: TransferRecord::next_timestamp(previous),
        };
        self.appended.push(record.clone());
        Ok(record)
    }

    fn list_transfers(&mut self) -> Result<Vec<TransferRecord>, StorageError> {
        let mut records = match &self.log {
            Some(log) => log.to_vec(),
            None => self
                .storage
                .transfers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };
        records.extend(self.appended.iter().cloned());
        Ok(records)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        {
            let mut accounts = self
                .storage
                .accounts
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for (id, pending) in std::mem::take(&mut self.writes) {
                match pending {
                    Some(account) => {
                        accounts.insert(id, account);
                    }
                    None => {
                        accounts.remove(&id);
                    }
                }
            }
        }
        let appended = std::mem::take(&mut self.appended);
        if let Some(log) = self.log.as_mut() {
            log.extend(appended);
        }
        self.finished = true;
        tracing::debug!(tx_id = self.tx_id, "Transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.writes.clear();
        self.appended.clear();
        self.finished = true;
        tracing::debug!(tx_id = self.tx_id, "Transaction rolled back");
        Ok(())
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(tx_id = self.tx_id, "Transaction rolled back on drop");
        }
        // Buffered writes were either published by commit or are discarded
        // here; either way the rows can be handed on.
        self.storage.row_locks.release(self.tx_id, &self.locked);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::{
        sync::{mpsc, Arc},
        thread,
        time::Instant,
    };

    fn create(storage: &InMemoryStorage, name: &str, balance: Decimal) -> Account {
        let mut tx = storage.begin().unwrap();
        let account = tx
            .insert_account(&CreateAccountCommand {
                name: name.to_string(),
                balance,
            })
            .unwrap();
        tx.commit().unwrap();
        account
    }

    #[test]
    fn test_memory_basic_operations() {
        let storage = InMemoryStorage::new();
        let alice = create(&storage, "alice", dec!(100));
        let bob = create(&storage, "bob", dec!(0));
        assert_ne!(alice.id, bob.id);

        let mut tx = storage.begin().unwrap();
        tx.adjust_balance(alice.id, dec!(-30)).unwrap();
        tx.adjust_balance(bob.id, dec!(30)).unwrap();
        tx.commit().unwrap();

        let mut tx = storage.begin().unwrap();
        assert_eq!(tx.get_account(alice.id).unwrap().balance, dec!(70));
        assert_eq!(tx.get_account(bob.id).unwrap().balance, dec!(30));
        let ids: Vec<AccountId> = tx.list_accounts().unwrap().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![alice.id, bob.id]);
    }

    #[test]
    fn test_memory_transaction_rollback() {
        let storage = InMemoryStorage::new();
        let alice = create(&storage, "alice", dec!(100));

        let mut tx = storage.begin().unwrap();
        tx.adjust_balance(alice.id, dec!(-40)).unwrap();
        tx.append_transfer(&AppendTransferCommand {
            sender_id: alice.id,
            receiver_id: AccountId(99),
            amount: dec!(40),
        })
        .unwrap();
        tx.rollback().unwrap();

        let mut tx = storage.begin().unwrap();
        assert_eq!(tx.get_account(alice.id).unwrap().balance, dec!(100));
        assert!(tx.list_transfers().unwrap().is_empty());
    }

    #[test]
    fn test_uncommitted_writes_are_invisible() {
        let storage = InMemoryStorage::new();
        let alice = create(&storage, "alice", dec!(100));

        let mut writer = storage.begin().unwrap();
        writer.adjust_balance(alice.id, dec!(-60)).unwrap();
        assert_eq!(writer.get_account(alice.id).unwrap().balance, dec!(40));

        let mut reader = storage.begin().unwrap();
        assert_eq!(reader.get_account(alice.id).unwrap().balance, dec!(100));
        drop(reader);

        writer.commit().unwrap();
        let mut reader = storage.begin().unwrap();
        assert_eq!(reader.get_account(alice.id).unwrap().balance, dec!(40));
    }

    #[test]
    fn test_adjust_below_zero_is_rejected() {
        let storage = InMemoryStorage::new();
        let alice = create(&storage, "alice", dec!(10));

        let mut tx = storage.begin().unwrap();
        let result = tx.adjust_balance(alice.id, dec!(-10.01));
        assert!(matches!(result, Err(StorageError::InsufficientFunds(id)) if id == alice.id));
        assert_eq!(tx.adjust_balance(alice.id, dec!(-10)).unwrap().balance, Decimal::ZERO);
    }

    #[test]
    fn test_adjust_past_max_is_an_error() {
        let storage = InMemoryStorage::new();
        let whale = create(&storage, "whale", Decimal::MAX);

        let mut tx = storage.begin().unwrap();
        let result = tx.adjust_balance(whale.id, dec!(1));
        assert!(matches!(result, Err(StorageError::BalanceOverflow(id)) if id == whale.id));
        tx.rollback().unwrap();

        let mut tx = storage.begin().unwrap();
        assert_eq!(tx.get_account(whale.id).unwrap().balance, Decimal::MAX);
    }

    #[test]
    fn test_missing_account() {
        let storage = InMemoryStorage::new();
        let mut tx = storage.begin().unwrap();
        assert!(matches!(tx.get_account(AccountId(5)), Err(StorageError::AccountNotFound(AccountId(5)))));
        assert!(matches!(tx.adjust_balance(AccountId(5), dec!(1)), Err(StorageError::AccountNotFound(AccountId(5)))));
        assert!(matches!(tx.delete_account(AccountId(5)), Err(StorageError::AccountNotFound(AccountId(5)))));
    }

    #[test]
    fn test_delete_is_published_on_commit() {
        let storage = InMemoryStorage::new();
        let alice = create(&storage, "alice", dec!(10));

        let mut tx = storage.begin().unwrap();
        assert_eq!(tx.delete_account(alice.id).unwrap(), alice);
        assert!(tx.list_accounts().unwrap().is_empty());
        tx.commit().unwrap();

        let mut tx = storage.begin().unwrap();
        assert!(matches!(tx.get_account(alice.id), Err(StorageError::AccountNotFound(_))));
    }

    #[test]
    fn test_conflicting_writer_times_out() {
        let storage = InMemoryStorage::with_lock_timeout(Duration::from_millis(20));
        let alice = create(&storage, "alice", dec!(10));

        let mut first = storage.begin().unwrap();
        first.adjust_balance(alice.id, dec!(-1)).unwrap();

        let mut second = storage.begin().unwrap();
        let result = second.adjust_balance(alice.id, dec!(-1));
        assert!(matches!(result, Err(StorageError::LockTimeout(id)) if id == alice.id));
    }

    #[test]
    fn test_opposite_order_writers_fail_fast() {
        let storage = InMemoryStorage::new();
        let alice = create(&storage, "alice", dec!(10));
        let bob = create(&storage, "bob", dec!(10));
        let (alice_id, bob_id) = (alice.id, bob.id);

        let mut second = storage.begin().unwrap();
        second.adjust_balance(bob_id, dec!(-1)).unwrap();

        let (locked, wait_locked) = mpsc::channel();
        let started = Instant::now();
        let (first_result, second_result) = thread::scope(|s| {
            let storage = &storage;
            let first = s.spawn(move || {
                let mut tx = storage.begin().unwrap();
                tx.adjust_balance(alice_id, dec!(-1)).unwrap();
                locked.send(()).unwrap();
                tx.adjust_balance(bob_id, dec!(1)).map(|_| ())
            });
            wait_locked.recv().unwrap();
            let second_result = second.adjust_balance(alice_id, dec!(1)).map(|_| ());
            drop(second);
            (first.join().unwrap(), second_result)
        });

        // One side closes the cycle and is refused, the other goes through
        let conflicts = [&first_result, &second_result]
            .iter()
            .filter(|r| matches!(r, Err(StorageError::Conflict(_))))
            .count();
        assert_eq!(conflicts, 1);
        assert!(first_result.is_ok() || second_result.is_ok());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_dropped_transaction_releases_locks() {
        let storage = InMemoryStorage::with_lock_timeout(Duration::from_millis(20));
        let alice = create(&storage, "alice", dec!(10));

        {
            let mut tx = storage.begin().unwrap();
            tx.adjust_balance(alice.id, dec!(-5)).unwrap();
        }

        let mut tx = storage.begin().unwrap();
        assert_eq!(tx.adjust_balance(alice.id, dec!(-10)).unwrap().balance, Decimal::ZERO);
    }

    #[test]
    fn test_transfer_log_order_and_timestamps() {
        let storage = Arc::new(InMemoryStorage::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let storage = storage.clone();
                thread::spawn(move || {
                    let mut tx = storage.begin().unwrap();
                    tx.append_transfer(&AppendTransferCommand {
                        sender_id: AccountId(i),
                        receiver_id: AccountId(i + 100),
                        amount: dec!(1),
                    })
                    .unwrap();
                    tx.commit().unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut tx = storage.begin().unwrap();
        let log = tx.list_transfers().unwrap();
        assert_eq!(log.len(), 8);
        for (i, pair) in log.windows(2).enumerate() {
            assert_eq!(pair[0].id, i as i64 + 1);
            assert_eq!(pair[1].id, pair[0].id + 1);
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }
}
