//! HTTP API server for the Anchor node.
//!
//! Thin JSON surface over the Identity Service: issuance, verification,
//! lifecycle requests and dead-letter operations.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anchor_core::{BlockchainJob, DidRecord, DidStatus, JobId, UserId};
use anchor_ledger::RegistryStats;
use anchor_service::{
    IdentityService, PollReport, ReconciliationWorker, ServiceError, VerificationResponse,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

/// Handles shared by every request.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<IdentityService>,
    pub worker: Arc<ReconciliationWorker>,
}

// --- Request / response types ---

#[derive(Deserialize)]
pub struct CreateDidRequest {
    pub user_id: UserId,
    pub name: String,
    pub email: String,
}

#[derive(Deserialize)]
pub struct VerifyQuery {
    pub did: String,
    #[serde(default)]
    pub user_hash: Option<String>,
}

#[derive(Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct DidResponse {
    pub did: String,
    pub user_id: String,
    pub user_hash: String,
    pub public_key: String,
    pub status: DidStatus,
    pub chain_tx: Option<String>,
    pub created_at: String,
}

impl From<&DidRecord> for DidResponse {
    fn from(record: &DidRecord) -> Self {
        Self {
            did: record.did.clone(),
            user_id: record.user_id.to_string(),
            user_hash: record.user_hash.clone(),
            public_key: record.public_key.clone(),
            status: record.status,
            chain_tx: record.chain_tx.clone(),
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub struct CreateDidResponse {
    #[serde(flatten)]
    pub identity: DidResponse,
    /// Registration job, absent if it is left to the orphan sweep.
    pub job_id: Option<JobId>,
}

#[derive(Serialize)]
pub struct JobsResponse {
    pub jobs: Vec<BlockchainJob>,
    pub count: usize,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

const DEFAULT_LIST_LIMIT: usize = 50;

fn error_response(e: ServiceError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Conflict(_) | ServiceError::InvalidState(_) => StatusCode::CONFLICT,
        ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        ServiceError::Ledger(_) => StatusCode::BAD_GATEWAY,
        ServiceError::Generation(_) | ServiceError::Store(_) | ServiceError::Queue(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        tracing::error!(error = %e, "request failed");
    }
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

fn bad_request(message: String) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: message }))
}

// --- Handlers ---

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_create(
    State(state): State<AppState>,
    Json(req): Json<CreateDidRequest>,
) -> ApiResult<(StatusCode, Json<CreateDidResponse>)> {
    let created = state
        .service
        .create(req.user_id, &req.name, &req.email)
        .await
        .map_err(error_response)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateDidResponse {
            identity: DidResponse::from(&created.record),
            job_id: created.job.map(|j| j.id),
        }),
    ))
}

async fn handle_verify(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> ApiResult<Json<VerificationResponse>> {
    state
        .service
        .verify(&query.did, query.user_hash.as_deref())
        .await
        .map(Json)
        .map_err(error_response)
}

async fn handle_status(
    State(state): State<AppState>,
    Path(did): Path<String>,
) -> ApiResult<Json<VerificationResponse>> {
    state
        .service
        .status(&did)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn handle_by_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<DidResponse>> {
    let user_id = UserId::from_str(&user_id).map_err(|e| bad_request(e.to_string()))?;
    let record = state
        .service
        .get_by_user_id(&user_id)
        .await
        .map_err(error_response)?;
    Ok(Json(DidResponse::from(&record)))
}

async fn handle_update(
    State(state): State<AppState>,
    Path(did): Path<String>,
) -> ApiResult<(StatusCode, Json<BlockchainJob>)> {
    let job = state
        .service
        .request_update(&did)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn handle_revoke(
    State(state): State<AppState>,
    Path(did): Path<String>,
) -> ApiResult<(StatusCode, Json<BlockchainJob>)> {
    let job = state.service.revoke(&did).await.map_err(error_response)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn handle_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<JobsResponse>> {
    let jobs = state
        .service
        .dead_letters(query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await
        .map_err(error_response)?;
    let count = jobs.len();
    Ok(Json(JobsResponse { jobs, count }))
}

async fn handle_requeue(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<BlockchainJob>> {
    let id = JobId::from_str(&id).map_err(|e| bad_request(e.to_string()))?;
    state
        .service
        .requeue_dead_letter(&id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn handle_get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<BlockchainJob>> {
    let id = JobId::from_str(&id).map_err(|e| bad_request(e.to_string()))?;
    state
        .service
        .get_job(&id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// Run one poller pass now instead of waiting for the interval.
async fn handle_process(State(state): State<AppState>) -> ApiResult<Json<PollReport>> {
    state
        .worker
        .poll_once()
        .await
        .map(Json)
        .map_err(error_response)
}

async fn handle_registry_stats(State(state): State<AppState>) -> ApiResult<Json<RegistryStats>> {
    state
        .service
        .registry_stats()
        .await
        .map(Json)
        .map_err(error_response)
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(handle_health))
        .route("/api/v1/did", post(handle_create))
        .route("/api/v1/did/verify", get(handle_verify))
        .route("/api/v1/did/status/{did}", get(handle_status))
        .route("/api/v1/did/user/{user_id}", get(handle_by_user))
        .route("/api/v1/did/{did}/update", post(handle_update))
        .route("/api/v1/did/{did}/revoke", post(handle_revoke))
        .route("/api/v1/jobs/dead-letters", get(handle_dead_letters))
        .route("/api/v1/jobs/process", post(handle_process))
        .route("/api/v1/jobs/{id}", get(handle_get_job))
        .route("/api/v1/jobs/{id}/requeue", post(handle_requeue))
        .route("/api/v1/registry/stats", get(handle_registry_stats))
        .with_state(state)
}

pub async fn start_api_server(listen_addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "HTTP API server started");
    axum::serve(listener, app).await?;
    Ok(())
}
