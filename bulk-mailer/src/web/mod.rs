//! HTTP control surface.
//!
//! A thin adapter over the core:
//! - `POST /start[?csv=<path>]` starts the consumer and enqueues a recipient source
//! - `POST /stop`, `POST /pause`, `POST /resume`
//! - `GET /monitor` returns counters, pause state and queue depth
//! - `POST /limit` sets the global send rate
//! - `GET /health`

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{
    health, monitor, pause, resume, set_limit, start, stop, ApiError, AppState, ErrorResponse,
    HealthResponse, LimitRequest, LimitResponse, StartParams, StartResponse, StatusResponse,
};

/// Build the control router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/monitor", get(monitor))
        .route("/limit", post(set_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
