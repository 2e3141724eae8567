//! Health & Status API endpoints
//!
//! - GET /health - Liveness check
//! - GET /metrics - Prometheus metrics
//! - GET /status - Record counts by status, cursor, uptime
//! - GET /failed - Deposits escalated to the operator

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::metrics;
use crate::store::RecordStore;
use crate::types::{DepositRecord, Status};

const DEFAULT_FAILED_LIMIT: usize = 50;
const MAX_FAILED_LIMIT: usize = 500;

#[derive(Clone)]
pub struct ApiState {
    pub store: RecordStore,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(store: RecordStore) -> Self {
        Self {
            store,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub uptime_seconds: u64,
    /// Highest source position fully delivered to the store
    pub cursor: Option<u64>,
    pub deposits: BTreeMap<String, u64>,
}

#[derive(Debug, Serialize)]
pub struct FailedResponse {
    pub deposits: Vec<DepositRecord>,
}

#[derive(Debug, Deserialize)]
pub struct FailedQuery {
    pub limit: Option<usize>,
}

async fn health() -> &'static str {
    "OK"
}

async fn status(State(state): State<ApiState>) -> Result<Json<StatusResponse>, Response> {
    let counts = state
        .store
        .status_counts()
        .await
        .map_err(store_unavailable)?;
    let cursor = state.store.cursor().await.map_err(store_unavailable)?;

    // Zero-fill so every status is always reported
    let deposits = Status::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), counts.get(s).copied().unwrap_or(0)))
        .collect();

    Ok(Json(StatusResponse {
        status: "ok".to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        cursor,
        deposits,
    }))
}

async fn failed(
    State(state): State<ApiState>,
    Query(query): Query<FailedQuery>,
) -> Result<Json<FailedResponse>, Response> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_FAILED_LIMIT)
        .min(MAX_FAILED_LIMIT);
    let deposits = state
        .store
        .list_by_status(Status::Failed, limit)
        .await
        .map_err(store_unavailable)?;
    Ok(Json(FailedResponse { deposits }))
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

fn store_unavailable(err: impl std::fmt::Display) -> Response {
    warn!(error = %err, "Store read failed while serving API request");
    (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/failed", get(failed))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Start the API server
pub async fn start_api_server(addr: SocketAddr, state: ApiState) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");

    metrics::UP.set(1.0);

    axum::serve(listener, router(state)).await?;
    Ok(())
}
