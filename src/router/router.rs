// HTTP API assembly
// Builds the axum router with every endpoint, the admission gate and request
// tracing, plus the liveness, readiness and metrics handlers.

use std::sync::Arc;

use axum::{
    extract::{connect_info::Connected, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    serve::IncomingStream,
    Router as AxumRouter,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::error;

use super::{monitor, products};
use crate::control::AdmissionLayer;
use crate::errors::{ErrorResponse, LookupError};
use crate::metrics::ACTIVE_CONNECTIONS;
use crate::state::{AppState, ReadinessReport};

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn api_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse::new(code, message)))
}

impl From<LookupError> for (StatusCode, Json<ErrorResponse>) {
    fn from(err: LookupError) -> Self {
        let status = match err {
            LookupError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            LookupError::Backend(_) | LookupError::Dispatch(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorResponse::from(&err)))
    }
}

/// Create the HTTP router with API endpoints
pub fn create_api_router(state: Arc<AppState>) -> AxumRouter {
    let gate = AdmissionLayer::new(
        Arc::clone(&state.controller),
        state.metrics.in_flight_requests.clone(),
    );
    AxumRouter::new()
        .route("/api/v1/products/batch", post(products::get_batch))
        .route("/api/v1/products/:id", get(products::get_product))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_text))
        .route("/monitor/cache", get(monitor::cache_stats))
        .route("/monitor/blocking", get(monitor::blocking_stats))
        .route("/monitor/threads", get(monitor::all_threads))
        .route("/monitor/threads/monitored", get(monitor::monitored_threads))
        .route("/monitor/status", get(monitor::status))
        .route("/monitor/shedder", get(monitor::shedder))
        .route("/monitor/dispatcher", get(monitor::dispatcher))
        .layer(gate)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub status: &'static str,
    pub timestamp: String,
    pub db_connected: bool,
}

/// Liveness: the process serves requests and can reach the store
async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let db_connected = state.products.db_connected().await;
    let code = if db_connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            healthy: db_connected,
            status: if db_connected { "healthy" } else { "unhealthy" },
            timestamp: timestamp(),
            db_connected,
        }),
    )
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    #[serde(flatten)]
    pub report: ReadinessReport,
    pub timestamp: String,
}

async fn readiness_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadyResponse>) {
    let report = state.readiness_report().await;
    let code = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(ReadyResponse {
            report,
            timestamp: timestamp(),
        }),
    )
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "metrics render failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Per-connection token; holding it keeps the connection counted.
#[derive(Clone)]
pub struct ConnectionToken(Arc<ConnectionGuard>);

pub struct ConnectionGuard;

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        ACTIVE_CONNECTIONS.dec();
    }
}

impl ConnectionToken {
    pub fn open() -> Self {
        ACTIVE_CONNECTIONS.inc();
        Self(Arc::new(ConnectionGuard))
    }
}

impl Connected<IncomingStream<'_>> for ConnectionToken {
    fn connect_info(_target: IncomingStream<'_>) -> Self {
        Self::open()
    }
}
