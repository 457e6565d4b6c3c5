use thiserror::Error;

use crate::{config::ConfigError, storage::StorageError};

/// Failures that stop the service from starting or serving.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to open storage: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
    #[error("server error: {0}")]
    Server(String),
}
