use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use crate::api::health::{HealthReport, HealthState};
use crate::api::latency::{LatencyStats, LatencySummary};
use crate::config::normalize_base_url;
use crate::error::AppError;
use crate::fetch::client::build_url;
use crate::fetch::{HttpTransport, TransportError};
use crate::state::orchestrator::{EntityState, LoadMoreOutcome};
use crate::state::{AggregateStatus, DataOrchestrator, EntityKind, RefreshOutcome};
use crate::types::Target;

/// Query parameter that overrides the pool upstream for one request.
pub const API_URL_PARAM: &str = "apiUrl";

#[derive(Clone)]
pub struct RelayState {
    pub transport: Arc<dyn HttpTransport>,
    pub pool_api_url: String,
    pub price_api_url: String,
    /// Deadline for one forwarded request.
    pub timeout: Duration,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
    pub orchestrator: Option<Arc<DataOrchestrator>>,
}

pub fn router(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/*path", get(relay_pool).options(preflight))
        .route("/price/*path", get(relay_price).options(preflight))
        .route("/entities/:kind", get(get_entity))
        .route("/entities/:kind/load_more", post(post_load_more))
        .route("/entities/:kind/load_older", post(post_load_older))
        .route("/refetch", post(post_refetch))
        .route("/target", get(get_target).put(put_target))
        .route("/cache", delete(delete_cache))
        .route("/health", get(get_health))
        .route("/stats/latency", get(get_stats_latency))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct EntityResponse {
    pub kind: EntityKind,
    /// `None` until the entity is tracked and fetched at least once.
    pub state: Option<EntityState>,
}

#[derive(Serialize)]
pub struct LoadOlderResponse {
    pub added: usize,
    pub total: usize,
}

#[derive(Serialize)]
pub struct RefreshReport {
    pub kind: EntityKind,
    pub outcome: &'static str,
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct RefetchResponse {
    pub outcomes: Vec<RefreshReport>,
    pub status: AggregateStatus,
}

/// Body of `PUT /target`. A missing `api_url` keeps the current one; a missing
/// `address` stops tracking a miner.
#[derive(Deserialize)]
pub struct TargetRequest {
    pub api_url: Option<String>,
    pub address: Option<String>,
}

#[derive(Serialize)]
pub struct TargetResponse {
    pub target: Target,
    #[serde(flatten)]
    pub refetch: RefetchResponse,
}

#[derive(Serialize)]
pub struct ClearCacheResponse {
    pub removed: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Bare OPTIONS without CORS request headers; real preflights are answered by the CORS layer.
async fn preflight() -> StatusCode {
    StatusCode::OK
}

async fn relay_pool(
    State(state): State<RelayState>,
    Path(path): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Value>, AppError> {
    let mut base = state.pool_api_url.clone();
    let mut forwarded = Vec::with_capacity(params.len());
    for (key, value) in params {
        if key == API_URL_PARAM {
            base = normalize_base_url(&value);
        } else {
            forwarded.push((key, value));
        }
    }
    forward(&state, &base, &format!("/api/{path}"), &forwarded).await
}

async fn relay_price(
    State(state): State<RelayState>,
    Path(path): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<Value>, AppError> {
    let base = state.price_api_url.clone();
    forward(&state, &base, &format!("/{path}"), &params).await
}

async fn forward(
    state: &RelayState,
    base: &str,
    endpoint: &str,
    params: &[(String, String)],
) -> Result<Json<Value>, AppError> {
    let params: Vec<(&str, String)> = params.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
    let url = build_url(base, endpoint, &params)?;

    let started = Instant::now();
    let body = tokio::time::timeout(state.timeout, state.transport.get_json(&url))
        .await
        .map_err(|_| TransportError::Timeout)??;
    state.latency.record(started.elapsed());
    debug!(%url, "Relayed upstream response");
    Ok(Json(body))
}

fn orchestrator(state: &RelayState) -> Result<&DataOrchestrator, AppError> {
    state
        .orchestrator
        .as_deref()
        .ok_or_else(|| AppError::Unsupported("entity state is not served by this relay".into()))
}

async fn get_entity(
    State(state): State<RelayState>,
    Path(kind): Path<EntityKind>,
) -> Result<Json<EntityResponse>, AppError> {
    let state = orchestrator(&state)?.state(kind);
    Ok(Json(EntityResponse { kind, state }))
}

async fn post_load_more(
    State(state): State<RelayState>,
    Path(kind): Path<EntityKind>,
) -> Result<Json<LoadMoreOutcome>, AppError> {
    let outcome = orchestrator(&state)?.load_more(kind).await?;
    Ok(Json(outcome))
}

async fn post_load_older(
    State(state): State<RelayState>,
    Path(kind): Path<EntityKind>,
) -> Result<Json<LoadOlderResponse>, AppError> {
    let orchestrator = orchestrator(&state)?;
    let added = orchestrator.load_older(kind).await?;
    let total = orchestrator.data(kind).map_or(0, |d| d.len());
    Ok(Json(LoadOlderResponse { added, total }))
}

async fn post_refetch(State(state): State<RelayState>) -> Result<Json<RefetchResponse>, AppError> {
    Ok(Json(refetch(orchestrator(&state)?).await))
}

async fn get_target(State(state): State<RelayState>) -> Result<Json<Target>, AppError> {
    Ok(Json(orchestrator(&state)?.target()))
}

async fn put_target(
    State(state): State<RelayState>,
    Json(req): Json<TargetRequest>,
) -> Result<Json<TargetResponse>, AppError> {
    let orchestrator = orchestrator(&state)?;
    let api_url = req.api_url.unwrap_or_else(|| orchestrator.target().api_url);
    let target = Target::new(api_url, req.address);
    info!(
        api_url = %target.api_url,
        address = target.address.as_deref().unwrap_or("-"),
        "Target switch requested",
    );
    orchestrator.set_target(target).await;

    let refetch = refetch(orchestrator).await;
    Ok(Json(TargetResponse { target: orchestrator.target(), refetch }))
}

async fn delete_cache(State(state): State<RelayState>) -> Result<Json<ClearCacheResponse>, AppError> {
    let removed = orchestrator(&state)?.cache().clear().await;
    Ok(Json(ClearCacheResponse { removed }))
}

async fn refetch(orchestrator: &DataOrchestrator) -> RefetchResponse {
    let outcomes = orchestrator
        .refetch()
        .await
        .into_iter()
        .map(|(kind, outcome)| RefreshReport {
            kind,
            outcome: outcome.as_str(),
            error: match outcome {
                RefreshOutcome::Failed(e) => Some(e),
                _ => None,
            },
        })
        .collect();
    RefetchResponse { outcomes, status: orchestrator.status() }
}

async fn get_health(State(state): State<RelayState>) -> Json<HealthReport> {
    let status = state.orchestrator.as_ref().map(|o| o.status());
    Json(state.health.report(status))
}

async fn get_stats_latency(State(state): State<RelayState>) -> Json<LatencySummary> {
    Json(state.latency.summary())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
