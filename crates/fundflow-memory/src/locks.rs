use std::{
    collections::HashMap,
    sync::{Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

use fundflow_core::{AccountId, StorageError, TransactionId};

#[derive(Default)]
struct LockTable {
    holders: HashMap<AccountId, TransactionId>,
    // Which row each blocked transaction is waiting on
    waiting: HashMap<TransactionId, AccountId>,
}

impl LockTable {
    /// True if `tx` waiting on `id` would close a cycle in the wait-for graph.
    fn would_deadlock(&self, tx: TransactionId, id: AccountId) -> bool {
        let mut next = self.holders.get(&id).copied();
        // Each transaction waits on at most one row, so the walk is a chain
        for _ in 0..=self.waiting.len() {
            match next {
                Some(holder) if holder == tx => return true,
                Some(holder) => {
                    next = self
                        .waiting
                        .get(&holder)
                        .and_then(|row| self.holders.get(row))
                        .copied();
                }
                None => return false,
            }
        }
        false
    }
}

/// Exclusive per-account write locks.
///
/// A lock is held from a transaction's first write to an account until the
/// transaction ends. A waiter that would complete a wait-for cycle fails at
/// once with `Conflict`; any other waiter gives up after the timeout.
pub(crate) struct RowLocks {
    table: Mutex<LockTable>,
    released: Condvar,
}

impl RowLocks {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
        }
    }

    pub fn acquire(&self, tx: TransactionId, id: AccountId, timeout: Duration) -> Result<(), StorageError> {
        let deadline = Instant::now() + timeout;
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match table.holders.get(&id) {
                None => break,
                Some(&holder) if holder == tx => return Ok(()),
                Some(_) => {}
            }
            if table.would_deadlock(tx, id) {
                table.waiting.remove(&tx);
                tracing::warn!(tx_id = tx, account_id = %id, "Deadlock detected on row lock");
                return Err(StorageError::Conflict(format!(
                    "deadlock detected waiting for account {}",
                    id
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                table.waiting.remove(&tx);
                tracing::warn!(tx_id = tx, account_id = %id, "Timed out waiting for row lock");
                return Err(StorageError::LockTimeout(id));
            }
            table.waiting.insert(tx, id);
            let (guard, _) = self
                .released
                .wait_timeout(table, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            table = guard;
        }
        table.waiting.remove(&tx);
        table.holders.insert(id, tx);
        Ok(())
    }

    pub fn release<'a>(&self, tx: TransactionId, ids: impl IntoIterator<Item = &'a AccountId>) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            if table.holders.get(id) == Some(&tx) {
                table.holders.remove(id);
            }
        }
        self.released.notify_all();
    }
}
