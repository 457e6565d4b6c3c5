//! HTTP adapter over the core.
//!
//! Handlers translate requests into `AccountStore` and `Ledger` calls and map
//! `LedgerError` onto status codes. Every core call runs on the blocking pool:
//! if the client goes away the transaction still runs to commit or rollback.

use std::{sync::Arc, time::Instant};

use axum::{
    extract::{Query, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use fundflow_core::{AccountId, Ledger, LedgerError, TransferRecord};

pub struct AppState {
    ledger: Arc<Ledger>,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(ledger: Arc<Ledger>, metrics: Option<PrometheusHandle>) -> Self {
        Self { ledger, metrics }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/account",
            post(create_account)
                .get(get_account)
                .put(update_account)
                .delete(delete_account),
        )
        .route("/accounts", get(list_accounts))
        .route("/transfer", post(transfer))
        .route("/transfers", get(list_transfers))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .layer(middleware::from_fn(log_requests))
        .with_state(Arc::new(state))
}

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub name: String,
    pub balance: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAccountRequest {
    pub id: AccountId,
    pub name: String,
    pub balance: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct AccountQuery {
    pub id: AccountId,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub sender: AccountId,
    pub receiver: AccountId,
    pub amount: Decimal,
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal storage error")
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidArgument(_) => Self::new(StatusCode::BAD_REQUEST, err.to_string()),
            LedgerError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            LedgerError::InsufficientFunds(_) => Self::new(StatusCode::BAD_REQUEST, "insufficient balance"),
            LedgerError::Storage(e) => {
                tracing::error!(error = %e, "Storage failure");
                Self::internal()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => {
            tracing::error!(error = %e, "Blocking task failed");
            Err(ApiError::internal())
        }
    }
}

fn transfer_outcome(result: &Result<TransferRecord, LedgerError>) -> &'static str {
    match result {
        Ok(_) => "committed",
        Err(LedgerError::InvalidArgument(_)) => "invalid_argument",
        Err(LedgerError::NotFound(_)) => "not_found",
        Err(LedgerError::InsufficientFunds(_)) => "insufficient_funds",
        Err(LedgerError::Storage(_)) => "storage_error",
    }
}

async fn create_account(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateAccountRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ledger = state.ledger.clone();
    let account = run_blocking(move || ledger.accounts().create(&req.name, req.balance)).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn get_account(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AccountQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let ledger = state.ledger.clone();
    let account = run_blocking(move || ledger.accounts().get(query.id)).await?;
    Ok(Json(account))
}

async fn update_account(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateAccountRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ledger = state.ledger.clone();
    let account = run_blocking(move || ledger.accounts().update(req.id, &req.name, req.balance)).await?;
    Ok(Json(account))
}

async fn delete_account(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AccountQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let ledger = state.ledger.clone();
    let account = run_blocking(move || ledger.accounts().delete(query.id)).await?;
    Ok(Json(account))
}

async fn list_accounts(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let ledger = state.ledger.clone();
    let accounts = run_blocking(move || ledger.accounts().list()).await?;
    Ok(Json(accounts))
}

async fn transfer(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TransferRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ledger = state.ledger.clone();
    let record = run_blocking(move || {
        let result = ledger.transfer(req.sender, req.receiver, req.amount);
        metrics::increment_counter!("fundflow_transfers_total", "outcome" => transfer_outcome(&result));
        result
    })
    .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_transfers(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let ledger = state.ledger.clone();
    let transfers = run_blocking(move || ledger.list_transfers()).await?;
    Ok(Json(transfers))
}

async fn health() -> &'static str {
    "ok"
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn log_requests<B>(req: Request<B>, next: Next<B>) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    let status = response.status().as_u16();
    tracing::info!(
        %method,
        %path,
        status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request served"
    );
    metrics::increment_counter!("fundflow_http_requests_total", "status" => status.to_string());
    response
}
