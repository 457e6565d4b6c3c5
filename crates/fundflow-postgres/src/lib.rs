use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Mutex, MutexGuard, PoisonError, TryLockError,
};

use postgres::{error::SqlState, Client, NoTls, Row};
use rust_decimal::Decimal;
use time::OffsetDateTime;

use fundflow_core::{
    Account, AccountId, AppendTransferCommand, CreateAccountCommand, StorageBackend, StorageError,
    StorageTransaction, TransactionId, TransferRecord, UpdateAccountCommand,
};

/// Advisory lock key serializing appends to the transfer log.
const TRANSFER_LOG_LOCK: i64 = 0x66_756e_6466_6c6f;

/// PostgreSQL-backed storage over a fixed set of connections.
///
/// Each transaction runs on one pooled client. Row locks taken by `UPDATE`
/// serialize writers to the same account, and a `CHECK (balance >= 0)`
/// constraint rejects overdrafts.
pub struct PostgresStorage {
    connection_string: String,
    clients: Vec<Mutex<Client>>,
    next: AtomicUsize,
    tx_counter: AtomicU64,
}

impl PostgresStorage {
    pub fn new(connection_string: &str, pool_size: usize) -> Result<Self, StorageError> {
        let clients = (0..pool_size.max(1))
            .map(|_| connect(connection_string).map(Mutex::new))
            .collect::<Result<Vec<_>, _>>()?;

        let storage = Self {
            connection_string: connection_string.to_string(),
            clients,
            next: AtomicUsize::new(0),
            tx_counter: AtomicU64::new(1),
        };
        storage.init_schema()?;
        tracing::debug!(pool_size = storage.clients.len(), "PostgreSQL storage ready");
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let mut client = self.checkout()?;
        client
            .batch_execute(
                "
            CREATE TABLE IF NOT EXISTS accounts (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                balance NUMERIC NOT NULL CHECK (balance >= 0)
            );

            CREATE TABLE IF NOT EXISTS transfers (
                id BIGSERIAL PRIMARY KEY,
                sender_id BIGINT NOT NULL,
                receiver_id BIGINT NOT NULL,
                amount NUMERIC NOT NULL CHECK (amount > 0),
                created_at TIMESTAMPTZ NOT NULL
            );
            ",
            )
            .map_err(pg_err)?;
        Ok(())
    }

    /// Takes the first idle client, or waits on one if all are busy.
    /// A client whose connection has dropped is replaced.
    fn checkout(&self) -> Result<MutexGuard<'_, Client>, StorageError> {
        let len = self.clients.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % len;
        let mut guard = None;
        for offset in 0..len {
            match self.clients[(start + offset) % len].try_lock() {
                Ok(client) => {
                    guard = Some(client);
                    break;
                }
                Err(TryLockError::Poisoned(poisoned)) => {
                    guard = Some(poisoned.into_inner());
                    break;
                }
                Err(TryLockError::WouldBlock) => continue,
            }
        }
        let mut client = match guard {
            Some(client) => client,
            None => self.clients[start].lock().unwrap_or_else(PoisonError::into_inner),
        };

        if client.is_closed() {
            tracing::warn!("PostgreSQL connection closed, reconnecting");
            *client = connect(&self.connection_string)?;
        }
        Ok(client)
    }
}

fn connect(connection_string: &str) -> Result<Client, StorageError> {
    Client::connect(connection_string, NoTls)
        .map_err(|e| StorageError::Other(format!("PostgreSQL connection failed: {}", e)))
}

fn pg_err(e: postgres::Error) -> StorageError {
    match e.code() {
        Some(code) if *code == SqlState::T_R_DEADLOCK_DETECTED || *code == SqlState::T_R_SERIALIZATION_FAILURE => {
            StorageError::Conflict(e.to_string())
        }
        _ => StorageError::Other(e.to_string()),
    }
}

fn account_from_row(row: &Row) -> Result<Account, StorageError> {
    let id: i64 = row.try_get(0).map_err(pg_err)?;
    Ok(Account {
        id: AccountId(id),
        name: row.try_get(1).map_err(pg_err)?,
        balance: row.try_get(2).map_err(pg_err)?,
    })
}

fn transfer_from_row(row: &Row) -> Result<TransferRecord, StorageError> {
    let sender: i64 = row.try_get(1).map_err(pg_err)?;
    let receiver: i64 = row.try_get(2).map_err(pg_err)?;
    Ok(TransferRecord {
        id: row.try_get(0).map_err(pg_err)?,
        sender_id: AccountId(sender),
        receiver_id: AccountId(receiver),
        amount: row.try_get(3).map_err(pg_err)?,
        timestamp: row.try_get::<_, OffsetDateTime>(4).map_err(pg_err)?,
    })
}

impl StorageBackend for PostgresStorage {
    fn begin(&self) -> Result<Box<dyn StorageTransaction + '_>, StorageError> {
        let mut client = self.checkout()?;
        client.batch_execute("BEGIN").map_err(pg_err)?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, "PostgreSQL transaction started");
        Ok(Box::new(PostgresTransaction {
            client,
            tx_id,
            finished: false,
        }))
    }
}

struct PostgresTransaction<'a> {
    client: MutexGuard<'a, Client>,
    tx_id: TransactionId,
    finished: bool,
}

impl StorageTransaction for PostgresTransaction<'_> {
    fn id(&self) -> TransactionId {
        self.tx_id
    }

    fn insert_account(&mut self, command: &CreateAccountCommand) -> Result<Account, StorageError> {
        let row = self
            .client
            .query_one(
                "INSERT INTO accounts (name, balance) VALUES ($1, $2) RETURNING id, name, balance",
                &[&command.name, &command.balance],
            )
            .map_err(pg_err)?;
        account_from_row(&row)
    }

    fn get_account(&mut self, id: AccountId) -> Result<Account, StorageError> {
        self.client
            .query_opt("SELECT id, name, balance FROM accounts WHERE id = $1", &[&id.0])
            .map_err(pg_err)?
            .ok_or(StorageError::AccountNotFound(id))
            .and_then(|row| account_from_row(&row))
    }

    fn list_accounts(&mut self) -> Result<Vec<Account>, StorageError> {
        self.client
            .query("SELECT id, name, balance FROM accounts ORDER BY id", &[])
            .map_err(pg_err)?
            .iter()
            .map(account_from_row)
            .collect()
    }

    fn update_account(&mut self, command: &UpdateAccountCommand) -> Result<Account, StorageError> {
        self.client
            .query_opt(
                "UPDATE accounts SET name = $1, balance = $2 WHERE id = $3 RETURNING id, name, balance",
                &[&command.name, &command.balance, &command.id.0],
            )
            .map_err(pg_err)?
            .ok_or(StorageError::AccountNotFound(command.id))
            .and_then(|row| account_from_row(&row))
    }

    fn delete_account(&mut self, id: AccountId) -> Result<Account, StorageError> {
        self.client
            .query_opt(
                "DELETE FROM accounts WHERE id = $1 RETURNING id, name, balance",
                &[&id.0],
            )
            .map_err(pg_err)?
            .ok_or(StorageError::AccountNotFound(id))
            .and_then(|row| account_from_row(&row))
    }

    fn adjust_balance(&mut self, id: AccountId, delta: Decimal) -> Result<Account, StorageError> {
        self.client
            .query_opt(
                "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING id, name, balance",
                &[&delta, &id.0],
            )
            .map_err(|e| {
                if e.code() == Some(&SqlState::CHECK_VIOLATION) {
                    StorageError::InsufficientFunds(id)
                } else {
                    pg_err(e)
                }
            })?
            .ok_or(StorageError::AccountNotFound(id))
            .and_then(|row| account_from_row(&row))
    }

    fn append_transfer(&mut self, command: &AppendTransferCommand) -> Result<TransferRecord, StorageError> {
        // Held until commit or rollback, so ids and timestamps follow commit order
        self.client
            .batch_execute(&format!("SELECT pg_advisory_xact_lock({})", TRANSFER_LOG_LOCK))
            .map_err(pg_err)?;
        let row = self
            .client
            .query_one(
                "INSERT INTO transfers (sender_id, receiver_id, amount, created_at)
                 VALUES ($1, $2, $3, GREATEST(
                     clock_timestamp(),
                     COALESCE((SELECT max(created_at) FROM transfers), '-infinity'::timestamptz)
                 ))
                 RETURNING id, sender_id, receiver_id, amount, created_at",
                &[&command.sender_id.0, &command.receiver_id.0, &command.amount],
            )
            .map_err(pg_err)?;
        transfer_from_row(&row)
    }

    fn list_transfers(&mut self) -> Result<Vec<TransferRecord>, StorageError> {
        self.client
            .query(
                "SELECT id, sender_id, receiver_id, amount, created_at FROM transfers ORDER BY id",
                &[],
            )
            .map_err(pg_err)?
            .iter()
            .map(transfer_from_row)
            .collect()
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.client.batch_execute("COMMIT").map_err(pg_err)?;
        self.finished = true;
        tracing::debug!(tx_id = self.tx_id, "PostgreSQL transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finished = true;
        self.client.batch_execute("ROLLBACK").map_err(pg_err)?;
        tracing::debug!(tx_id = self.tx_id, "PostgreSQL transaction rolled back");
        Ok(())
    }
}

impl Drop for PostgresTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            match self.client.batch_execute("ROLLBACK") {
                Ok(()) => tracing::debug!(tx_id = self.tx_id, "PostgreSQL transaction rolled back on drop"),
                Err(e) => tracing::error!(tx_id = self.tx_id, error = %e, "PostgreSQL rollback on drop failed"),
            }
        }
    }
}
