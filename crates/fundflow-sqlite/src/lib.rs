use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use fundflow_core::{
    Account, AccountId, AppendTransferCommand, CreateAccountCommand, StorageBackend, StorageError,
    StorageTransaction, TransactionId, TransferRecord, UpdateAccountCommand,
};

/// How long SQLite waits on a database locked by another process.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed storage over a single connection.
///
/// A transaction owns the connection from `BEGIN IMMEDIATE` until it ends, so
/// writers are serialized by the connection itself.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    tx_counter: AtomicU64,
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        Self::with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn with_busy_timeout(path: &str, busy_timeout: Duration) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(sql_err)?;

        let journal_mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(sql_err)?;
        conn.busy_timeout(busy_timeout).map_err(sql_err)?;
        tracing::debug!(path, journal_mode = %journal_mode, "SQLite database opened");

        let storage = Self {
            conn: Mutex::new(conn),
            tx_counter: AtomicU64::new(1),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                balance TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transfers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_id INTEGER NOT NULL,
                receiver_id INTEGER NOT NULL,
                amount TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            ",
        )
        .map_err(sql_err)?;
        Ok(())
    }
}

fn sql_err(e: rusqlite::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn parse_decimal(s: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(s).map_err(|e| StorageError::Other(format!("Invalid decimal: {}", e)))
}

fn parse_timestamp(s: &str) -> Result<OffsetDateTime, StorageError> {
    OffsetDateTime::parse(s, &Rfc3339).map_err(|e| StorageError::Other(format!("Invalid timestamp: {}", e)))
}

type AccountRow = (i64, String, String);
type TransferRow = (i64, i64, i64, String, String);

fn account_from_row((id, name, balance): AccountRow) -> Result<Account, StorageError> {
    Ok(Account {
        id: AccountId(id),
        name,
        balance: parse_decimal(&balance)?,
    })
}

fn transfer_from_row((id, sender, receiver, amount, created_at): TransferRow) -> Result<TransferRecord, StorageError> {
    Ok(TransferRecord {
        id,
        sender_id: AccountId(sender),
        receiver_id: AccountId(receiver),
        amount: parse_decimal(&amount)?,
        timestamp: parse_timestamp(&created_at)?,
    })
}

impl StorageBackend for SqliteStorage {
    fn begin(&self) -> Result<Box<dyn StorageTransaction + '_>, StorageError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute_batch("BEGIN IMMEDIATE").map_err(sql_err)?;
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(tx_id, "SQLite transaction started");
        Ok(Box::new(SqliteTransaction {
            conn,
            tx_id,
            finished: false,
        }))
    }
}

struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    tx_id: TransactionId,
    finished: bool,
}

impl SqliteTransaction<'_> {
    fn fetch_account(&self, id: AccountId) -> Result<Account, StorageError> {
        let row: Option<AccountRow> = self
            .conn
            .query_row(
                "SELECT id, name, balance FROM accounts WHERE id = ?1",
                params![id.0],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(sql_err)?;
        match row {
            Some(row) => account_from_row(row),
            None => Err(StorageError::AccountNotFound(id)),
        }
    }
}

impl StorageTransaction for SqliteTransaction<'_> {
    fn id(&self) -> TransactionId {
        self.tx_id
    }

    fn insert_account(&mut self, command: &CreateAccountCommand) -> Result<Account, StorageError> {
        self.conn
            .execute(
                "INSERT INTO accounts (name, balance) VALUES (?1, ?2)",
                params![command.name, command.balance.to_string()],
            )
            .map_err(sql_err)?;
        Ok(Account {
            id: AccountId(self.conn.last_insert_rowid()),
            name: command.name.clone(),
            balance: command.balance,
        })
    }

    fn get_account(&mut self, id: AccountId) -> Result<Account, StorageError> {
        self.fetch_account(id)
    }

    fn list_accounts(&mut self) -> Result<Vec<Account>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, balance FROM accounts ORDER BY id")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(sql_err)?
            .collect::<Result<Vec<AccountRow>, _>>()
            .map_err(sql_err)?;
        rows.into_iter().map(account_from_row).collect()
    }

    fn update_account(&mut self, command: &UpdateAccountCommand) -> Result<Account, StorageError> {
        let changed = self
            .conn
            .execute(
                "UPDATE accounts SET name = ?1, balance = ?2 WHERE id = ?3",
                params![command.name, command.balance.to_string(), command.id.0],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StorageError::AccountNotFound(command.id));
        }
        Ok(Account {
            id: command.id,
            name: command.name.clone(),
            balance: command.balance,
        })
    }

    fn delete_account(&mut self, id: AccountId) -> Result<Account, StorageError> {
        let account = self.fetch_account(id)?;
        self.conn
            .execute("DELETE FROM accounts WHERE id = ?1", params![id.0])
            .map_err(sql_err)?;
        Ok(account)
    }

    fn adjust_balance(&mut self, id: AccountId, delta: Decimal) -> Result<Account, StorageError> {
        let mut account = self.fetch_account(id)?;
        let balance = account
            .balance
            .checked_add(delta)
            .ok_or(StorageError::BalanceOverflow(id))?;
        if balance < Decimal::ZERO {
            return Err(StorageError::InsufficientFunds(id));
        }
        self.conn
            .execute(
                "UPDATE accounts SET balance = ?1 WHERE id = ?2",
                params![balance.to_string(), id.0],
            )
            .map_err(sql_err)?;
        account.balance = balance;
        Ok(account)
    }

    fn append_transfer(&mut self, command: &AppendTransferCommand) -> Result<TransferRecord, StorageError> {
        let previous: Option<String> = self
            .conn
            .query_row(
                "SELECT created_at FROM transfers ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        let previous = previous.as_deref().map(parse_timestamp).transpose()?;
        let timestamp = TransferRecord::next_timestamp(previous);
        let created_at = timestamp
            .format(&Rfc3339)
            .map_err(|e| StorageError::Other(format!("Invalid timestamp: {}", e)))?;

        self.conn
            .execute(
                "INSERT INTO transfers (sender_id, receiver_id, amount, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    command.sender_id.0,
                    command.receiver_id.0,
                    command.amount.to_string(),
                    created_at
                ],
            )
            .map_err(sql_err)?;

        Ok(TransferRecord {
            id: self.conn.last_insert_rowid(),
            sender_id: command.sender_id,
            receiver_id: command.receiver_id,
            amount: command.amount,
            timestamp,
        })
    }

    fn list_transfers(&mut self) -> Result<Vec<TransferRecord>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, sender_id, receiver_id, amount, created_at FROM transfers ORDER BY id")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })
            .map_err(sql_err)?
            .collect::<Result<Vec<TransferRow>, _>>()
            .map_err(sql_err)?;
        rows.into_iter().map(transfer_from_row).collect()
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.conn.execute_batch("COMMIT").map_err(sql_err)?;
        self.finished = true;
        tracing::debug!(tx_id = self.tx_id, "SQLite transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        // Marked finished first so a failed ROLLBACK is not retried on drop
        self.finished = true;
        self.conn.execute_batch("ROLLBACK").map_err(sql_err)?;
        tracing::debug!(tx_id = self.tx_id, "SQLite transaction rolled back");
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            match self.conn.execute_batch("ROLLBACK") {
                Ok(()) => tracing::debug!(tx_id = self.tx_id, "SQLite transaction rolled back on drop"),
                Err(e) => tracing::error!(tx_id = self.tx_id, error = %e, "SQLite rollback on drop failed"),
            }
        }
    }
}
