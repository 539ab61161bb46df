#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use parking_lot::Mutex;
use product_lookup::cache::ProductCache;
use product_lookup::clock::ManualClock;
use product_lookup::config::{MonitorConfig, ShedderConfig};
use product_lookup::control::AdmissionController;
use product_lookup::dispatch::BoundedDispatcher;
use product_lookup::metrics::Metrics;
use product_lookup::monitor::{StallDetector, WorkerSampler, WorkerSnapshot};
use product_lookup::router::create_api_router;
use product_lookup::service::ProductService;
use product_lookup::state::{AppReadiness, AppState};
use product_lookup::store::{Product, ProductStore};
use serde_json::Value;
use tower::ServiceExt;

/// Store that counts fetches and the peak number of concurrent fetches.
pub struct InstrumentedStore {
    products: HashMap<i64, Product>,
    pub fetches: AtomicUsize,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    delay: Duration,
    clock: Option<Arc<ManualClock>>,
    clock_step_ms: u64,
    pub failing_ids: Vec<i64>,
    pub reachable: bool,
}

impl InstrumentedStore {
    pub fn new(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            products: ids
                .into_iter()
                .map(|id| (id, Product::named(id, format!("product {id}"))))
                .collect(),
            fetches: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            delay: Duration::ZERO,
            clock: None,
            clock_step_ms: 0,
            failing_ids: Vec::new(),
            reachable: true,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every fetch moves the manual clock forward, standing in for latency.
    pub fn advancing(mut self, clock: Arc<ManualClock>, step_ms: u64) -> Self {
        self.clock = Some(clock);
        self.clock_step_ms = step_ms;
        self
    }

    pub fn failing(mut self, ids: Vec<i64>) -> Self {
        self.failing_ids = ids;
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl ProductStore for InstrumentedStore {
    fn find_by_id(&self, id: i64) -> anyhow::Result<Option<Product>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if let Some(clock) = &self.clock {
            clock.advance_ms(self.clock_step_ms);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.failing_ids.contains(&id) {
            anyhow::bail!("simulated failure for {id}");
        }
        Ok(self.products.get(&id).cloned())
    }

    fn ping(&self) -> bool {
        self.reachable
    }

    fn max_connections(&self) -> usize {
        64
    }
}

/// Sampler whose output the test controls.
#[derive(Default)]
pub struct ScriptedSampler {
    pub threads: Mutex<Vec<WorkerSnapshot>>,
    pub failing: AtomicBool,
}

impl ScriptedSampler {
    pub fn set(&self, threads: Vec<WorkerSnapshot>) {
        *self.threads.lock() = threads;
    }
}

impl WorkerSampler for ScriptedSampler {
    fn sample(&self, _with_trace: bool) -> anyhow::Result<Vec<WorkerSnapshot>> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("task directory unreadable");
        }
        Ok(self.threads.lock().clone())
    }
}

pub fn shedder_config() -> ShedderConfig {
    ShedderConfig {
        enabled: true,
        recent_time_window_seconds: 2,
        high_traffic_threshold_rps: 5,
        timeout_rate_percent: 1.0,
        response_time_threshold_ms: 5,
        check_interval_seconds: 1,
        trigger_consecutive_checks: 3,
        cooldown_consecutive_checks: 3,
        excluded_paths: vec!["/health".into(), "/ready".into(), "/metrics".into()],
    }
}

pub fn monitor_config() -> MonitorConfig {
    MonitorConfig {
        enabled: true,
        check_interval_ms: 10,
        warning_threshold_ms: 50,
        critical_threshold_ms: 200,
        stack_trace_on_warning: true,
        worker_patterns: vec!["lookup-worker".into()],
    }
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub router: Router,
    pub store: Arc<InstrumentedStore>,
    pub sampler: Arc<ScriptedSampler>,
    pub clock: Arc<ManualClock>,
    pub metrics: Metrics,
    pub cache: Option<Arc<ProductCache>>,
}

pub struct HarnessBuilder {
    shedder: ShedderConfig,
    cache: bool,
    store: Option<InstrumentedStore>,
    clock: Arc<ManualClock>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            shedder: shedder_config(),
            cache: true,
            store: None,
            clock: ManualClock::new(10_000),
        }
    }

    pub fn shedder(mut self, config: ShedderConfig) -> Self {
        self.shedder = config;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = false;
        self
    }

    pub fn clock(&self) -> Arc<ManualClock> {
        Arc::clone(&self.clock)
    }

    pub fn store(mut self, store: InstrumentedStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Harness {
        let metrics = Metrics::new().unwrap();
        let clock = self.clock;
        let store = Arc::new(
            self.store
                .unwrap_or_else(|| InstrumentedStore::new(1..=100)),
        );
        let dyn_store: Arc<dyn ProductStore> = store.clone();
        let dispatcher = Arc::new(BoundedDispatcher::new(8, Some(metrics.clone())));
        dispatcher.init(8);

        let cache = self.cache.then(|| {
            Arc::new(ProductCache::new(
                1_000,
                Arc::clone(&dyn_store),
                Arc::clone(&dispatcher),
                metrics.clone(),
                clock.clone(),
            ))
        });
        let sampler = Arc::new(ScriptedSampler::default());
        let state = Arc::new(AppState {
            products: ProductService::new(dyn_store, Arc::clone(&dispatcher), cache.clone()),
            controller: Arc::new(AdmissionController::new(
                self.shedder,
                metrics.clone(),
                clock.clone(),
            )),
            detector: Arc::new(StallDetector::new(
                monitor_config(),
                sampler.clone(),
                clock.clone(),
                Some(metrics.clone()),
            )),
            dispatcher,
            metrics: metrics.clone(),
            readiness: AppReadiness::default(),
        });
        state.readiness.mark_ready();

        Harness {
            router: create_api_router(Arc::clone(&state)),
            state,
            store,
            sampler,
            clock,
            metrics,
            cache,
        }
    }
}

pub struct Reply {
    pub status: StatusCode,
    pub body: String,
}

impl Reply {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or(Value::Null)
    }
}

impl Harness {
    pub async fn get(&self, path: &str) -> Reply {
        self.send(Method::GET, path, Body::empty()).await
    }

    pub async fn post_json(&self, path: &str, body: Value) -> Reply {
        self.send(Method::POST, path, Body::from(body.to_string())).await
    }

    async fn send(&self, method: Method, path: &str, body: Body) -> Reply {
        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        Reply {
            status,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        }
    }
}
