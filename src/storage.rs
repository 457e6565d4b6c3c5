use std::sync::Arc;

use fundflow_memory::InMemoryStorage;
use fundflow_postgres::PostgresStorage;
use fundflow_sqlite::SqliteStorage;

// Re-export core storage types so callers only need this crate
pub use fundflow_core::storage::{StorageBackend, StorageError, StorageTransaction, TransactionId};

use crate::config::{StorageConfig, StorageKind};

/// Opens the backend selected in config.
///
/// Connecting to PostgreSQL blocks, so call this off the async workers.
pub fn open(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>, StorageError> {
    let storage: Arc<dyn StorageBackend> = match config.backend {
        StorageKind::Memory => Arc::new(InMemoryStorage::with_lock_timeout(config.lock_timeout())),
        StorageKind::Sqlite => Arc::new(SqliteStorage::with_busy_timeout(
            &config.sqlite_path,
            config.lock_timeout(),
        )?),
        StorageKind::Postgres => Arc::new(PostgresStorage::new(&config.postgres_url, config.pool_size)?),
    };
    tracing::info!(backend = ?config.backend, "Storage opened");
    Ok(storage)
}
