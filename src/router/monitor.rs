// Diagnostic endpoints for the governance components

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json};
use serde::Serialize;
use tracing::warn;

use super::router::{api_error, timestamp, ApiError};
use crate::cache::CacheStats;
use crate::control::ShedderStatus;
use crate::dispatch::DispatcherStats;
use crate::monitor::{MonitorStatus, StallStats, WorkerInfo};
use crate::state::AppState;

pub async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStats> {
    match state.products.cache() {
        Some(cache) => Json(cache.stats().await),
        None => Json(CacheStats::disabled()),
    }
}

#[derive(Debug, Serialize)]
pub struct BlockingResponse {
    pub monitoring: bool,
    #[serde(flatten)]
    pub stats: StallStats,
}

pub async fn blocking_stats(State(state): State<Arc<AppState>>) -> Json<BlockingResponse> {
    Json(BlockingResponse {
        monitoring: state.detector.is_running(),
        stats: state.detector.stats(),
    })
}

#[derive(Debug, Serialize)]
pub struct ThreadsResponse {
    pub count: usize,
    pub threads: Vec<WorkerInfo>,
}

fn sampling_failed(err: anyhow::Error) -> ApiError {
    api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "BACKEND_ERROR",
        format!("thread sampling failed: {err:#}"),
    )
}

pub async fn all_threads(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ThreadsResponse>, ApiError> {
    let threads = state.detector.workers().map_err(sampling_failed)?;
    Ok(Json(ThreadsResponse {
        count: threads.len(),
        threads,
    }))
}

pub async fn monitored_threads(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ThreadsResponse>, ApiError> {
    let threads = state.detector.monitored_workers().map_err(sampling_failed)?;
    Ok(Json(ThreadsResponse {
        count: threads.len(),
        threads,
    }))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: MonitorStatus,
    pub stats: StallStats,
    pub threads: Vec<WorkerInfo>,
    pub timestamp: String,
}

/// Overall blocking status; 503 when a protected worker is blocked right now.
pub async fn status(State(state): State<Arc<AppState>>) -> (StatusCode, Json<StatusResponse>) {
    let stats = state.detector.stats();
    let status = MonitorStatus::from_stats(&stats);
    let threads = match state.detector.monitored_workers() {
        Ok(threads) => threads,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "thread sampling failed for status");
            Vec::new()
        }
    };
    let code = if status == MonitorStatus::Degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        code,
        Json(StatusResponse {
            status,
            stats,
            threads,
            timestamp: timestamp(),
        }),
    )
}

pub async fn shedder(State(state): State<Arc<AppState>>) -> Json<ShedderStatus> {
    Json(state.controller.status())
}

pub async fn dispatcher(State(state): State<Arc<AppState>>) -> Json<DispatcherStats> {
    Json(state.dispatcher.stats())
}
