//! Control endpoint handlers.
//!
//! Each handler is a thin call into one core operation. Any error becomes
//! `500 {"error": "<message>"}`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::lifecycle::Lifecycle;
use crate::limiter::{SlidingWindowLimiter, GLOBAL_RATE_KEY};
use crate::monitor::{Monitor, MonitorSnapshot};
use crate::pause::PauseControl;
use crate::producer::BulkProducer;
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub lifecycle: Arc<Lifecycle>,
    pub producer: Arc<BulkProducer>,
    pub pause: Arc<dyn PauseControl>,
    pub monitor: Arc<Monitor>,
    pub limiter: Arc<SlidingWindowLimiter>,
}

/// Uniform failure body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Any surfaced error, reported as a 500 with its message.
#[derive(Debug)]
pub struct ApiError(String);

impl<E: std::error::Error> From<E> for ApiError {
    fn from(err: E) -> Self {
        ApiError(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: self.0 }),
        )
            .into_response()
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Dispatch Control
// =============================================================================

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartParams {
    /// Recipient source; the configured default when absent or empty
    pub csv: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub enqueued: usize,
}

/// Start the consumer, then enqueue every recipient in the source.
pub async fn start(
    State(state): State<AppState>,
    Query(params): Query<StartParams>,
) -> Result<Json<StartResponse>, ApiError> {
    state.lifecycle.start().await.map_err(|e| {
        error!(error = %e, "start_consumer_failed");
        ApiError::from(e)
    })?;

    let source = params
        .csv
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| state.config.csv_path.clone());

    let enqueued = state.producer.enqueue_path(&source).await.map_err(|e| {
        error!(source = %source.display(), error = %e, "bulk_enqueue_failed");
        ApiError::from(e)
    })?;

    Ok(Json(StartResponse { enqueued }))
}

pub async fn stop(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    state.lifecycle.stop().await?;
    Ok(Json(StatusResponse { status: "stopped" }))
}

pub async fn pause(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    state.pause.pause().await?;
    Ok(Json(StatusResponse { status: "paused" }))
}

pub async fn resume(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    state.pause.resume().await?;
    Ok(Json(StatusResponse { status: "resumed" }))
}

pub async fn monitor(State(state): State<AppState>) -> Json<MonitorSnapshot> {
    Json(state.monitor.snapshot().await)
}

// =============================================================================
// Rate Limit
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct LimitRequest {
    /// Sends per window; 0 restores the default
    pub limit: u32,
}

#[derive(Debug, Serialize)]
pub struct LimitResponse {
    pub key: &'static str,
    pub limit: u32,
}

/// Override the global send rate.
pub async fn set_limit(
    State(state): State<AppState>,
    Json(req): Json<LimitRequest>,
) -> Json<LimitResponse> {
    state.limiter.set_limit(GLOBAL_RATE_KEY, req.limit);
    let limit = state.limiter.effective_limit(GLOBAL_RATE_KEY);
    info!(requested = req.limit, effective = limit, "global_rate_limit_updated");

    Json(LimitResponse {
        key: GLOBAL_RATE_KEY,
        limit,
    })
}
