use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use ledup_access_api::{
    AccessCheck, AccessLedgerApi, ActiveShareCount, CheckAccessRequest, IngestLogsRequest,
    IngestLogsResult, MigrateResult, RecordReadRequest, RecordViewRequest, RecordsOfRequest,
    SharedWithMeRequest, ViewResult, API_CONTRACT_VERSION,
};
use ledup_access_core::{HistoryEntry, RecordConsumer, Registration, SharedRecord};
use ledup_access_store_sqlite::SchemaStatus;
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: AccessLedgerApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "ledup-access-service")]
#[command(about = "Local HTTP service for the LED-UP access ledger")]
struct Args {
    #[arg(long, default_value = "./ledup_access.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        tracing::warn!(error = %format!("{err:#}"), "request failed");
        Self { service_contract_version: SERVICE_CONTRACT_VERSION, error: format!("{err:#}") }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

type ServiceResult<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/logs/ingest", post(logs_ingest))
        .route("/v1/reads/record", post(reads_record))
        .route("/v1/access/shared-with-me", post(access_shared_with_me))
        .route("/v1/access/consumers", post(access_consumers))
        .route("/v1/access/active-count", post(access_active_count))
        .route("/v1/access/history", post(access_history))
        .route("/v1/access/records-of", post(access_records_of))
        .route("/v1/access/check", post(access_check))
        .with_state(state)
}

fn init_tracing(fallback: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .map_err(|err| anyhow!("invalid log filter `{fallback}`: {err}"))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let state = ServiceState { api: AccessLedgerApi::new(args.db.clone()) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "access ledger service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(State(state): State<ServiceState>) -> ServiceResult<SchemaStatus> {
    Ok(Json(envelope(state.api.schema_status()?)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> ServiceResult<MigrateResult> {
    Ok(Json(envelope(state.api.migrate(request.dry_run)?)))
}

async fn logs_ingest(
    State(state): State<ServiceState>,
    Json(request): Json<IngestLogsRequest>,
) -> ServiceResult<IngestLogsResult> {
    Ok(Json(envelope(state.api.ingest_logs(request)?)))
}

async fn reads_record(
    State(state): State<ServiceState>,
    Json(request): Json<RecordReadRequest>,
) -> ServiceResult<RecordReadRequest> {
    Ok(Json(envelope(state.api.record_read(request)?)))
}

async fn access_shared_with_me(
    State(state): State<ServiceState>,
    Json(request): Json<SharedWithMeRequest>,
) -> ServiceResult<ViewResult<Vec<SharedRecord>>> {
    Ok(Json(envelope(state.api.shared_with_me(request)?)))
}

async fn access_consumers(
    State(state): State<ServiceState>,
    Json(request): Json<RecordViewRequest>,
) -> ServiceResult<ViewResult<Vec<RecordConsumer>>> {
    Ok(Json(envelope(state.api.consumers_of(request)?)))
}

async fn access_active_count(
    State(state): State<ServiceState>,
    Json(request): Json<RecordViewRequest>,
) -> ServiceResult<ViewResult<ActiveShareCount>> {
    Ok(Json(envelope(state.api.active_share_count(request)?)))
}

async fn access_history(
    State(state): State<ServiceState>,
    Json(request): Json<RecordViewRequest>,
) -> ServiceResult<ViewResult<Vec<HistoryEntry>>> {
    Ok(Json(envelope(state.api.access_history(request)?)))
}

async fn access_records_of(
    State(state): State<ServiceState>,
    Json(request): Json<RecordsOfRequest>,
) -> ServiceResult<ViewResult<Vec<Registration>>> {
    Ok(Json(envelope(state.api.records_of(request)?)))
}

async fn access_check(
    State(state): State<ServiceState>,
    Json(request): Json<CheckAccessRequest>,
) -> ServiceResult<ViewResult<AccessCheck>> {
    Ok(Json(envelope(state.api.check_access(request)?)))
}
