use std::sync::Arc;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;

use fundflow::{
    config::{CliArgs, Config},
    error::AppError,
    http::{self, AppState},
    logging, storage,
};
use fundflow_core::{AccountStore, Ledger};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = CliArgs::parse();
    let config = Config::load(&cli)?;
    logging::init(&config.logging);

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::Metrics(e.to_string()))?;

    let addr = config.listen_addr()?;
    let server = axum::Server::try_bind(&addr).map_err(|e| AppError::Server(e.to_string()))?;

    let storage_config = config.storage.clone();
    let storage = tokio::task::spawn_blocking(move || storage::open(&storage_config))
        .await
        .map_err(|e| AppError::Server(e.to_string()))??;
    let ledger = Arc::new(Ledger::new(AccountStore::new(storage)));

    let app = http::router(AppState::new(ledger.clone(), Some(metrics)));
    tracing::info!(%addr, "API listening");

    let served = server
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Closing a PostgreSQL client blocks, so the last handle goes to the blocking pool
    let _ = tokio::task::spawn_blocking(move || drop(ledger)).await;

    served.map_err(|e| AppError::Server(e.to_string()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
