// Shared application state and readiness
//
// Everything the HTTP handlers need, built once at startup and shared
// behind an Arc. Readiness combines the ready flag, store reachability and
// the warmup phase.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::cache::WarmupProgress;
use crate::control::AdmissionController;
use crate::dispatch::BoundedDispatcher;
use crate::metrics::Metrics;
use crate::monitor::StallDetector;
use crate::service::ProductService;

#[derive(Debug, Default)]
pub struct AppReadiness {
    ready: AtomicBool,
}

impl AppReadiness {
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub status: &'static str,
    pub db_connected: bool,
    pub cache_size: u64,
    pub cache_max_size: u64,
    pub warmup: Option<WarmupProgress>,
}

pub struct AppState {
    pub products: ProductService,
    pub controller: Arc<AdmissionController>,
    pub detector: Arc<StallDetector>,
    pub dispatcher: Arc<BoundedDispatcher>,
    pub metrics: Metrics,
    pub readiness: AppReadiness,
}

impl AppState {
    pub async fn readiness_report(&self) -> ReadinessReport {
        let db_connected = self.products.db_connected().await;
        let (cache_size, cache_max_size, warmup) = match self.products.cache() {
            Some(cache) => (
                cache.size().await,
                cache.max_size(),
                Some(cache.warmup_tracker().progress()),
            ),
            None => (0, 0, None),
        };
        let warmup_complete = warmup.map_or(true, |w| w.complete);

        let status = if !db_connected {
            "db_disconnected"
        } else if warmup.is_some_and(|w| w.in_progress) {
            "warmup_in_progress"
        } else if !warmup_complete {
            "warmup_pending"
        } else if !self.readiness.is_ready() {
            "starting"
        } else {
            "ready"
        };

        ReadinessReport {
            ready: self.readiness.is_ready() && db_connected && warmup_complete,
            status,
            db_connected,
            cache_size,
            cache_max_size,
            warmup,
        }
    }
}
