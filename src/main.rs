use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use product_lookup::cache::ProductCache;
use product_lookup::clock::SystemClock;
use product_lookup::config::AppConfig;
use product_lookup::control::AdmissionController;
use product_lookup::dispatch::BoundedDispatcher;
use product_lookup::metrics::Metrics;
use product_lookup::monitor::{ParkRegistry, ProcfsSampler, StallDetector};
use product_lookup::router::{create_api_router, ConnectionToken};
use product_lookup::service::ProductService;
use product_lookup::state::{AppReadiness, AppState};
use product_lookup::store::{MemoryStore, ProductStore};

fn main() -> Result<()> {
    init_tracing().context("initialize tracing subscriber")?;

    let config = AppConfig::load().context("load configuration")?;
    let park_registry = ParkRegistry::new();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder
        .worker_threads(config.server.worker_threads)
        .thread_name(config.server.worker_thread_name.clone())
        .enable_all();
    park_registry.install(&mut builder);
    let runtime = builder.build().context("build tokio runtime")?;

    let app = match App::build(config, park_registry) {
        Ok(app) => app,
        Err(err) => {
            error!(error = ?err, "fatal lookup server error");
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(app.run());
    app.shutdown();
    runtime.shutdown_timeout(Duration::from_secs(5));

    if let Err(err) = result {
        error!(error = ?err, "fatal lookup server error");
        std::process::exit(1);
    }
    Ok(())
}

struct App {
    config: Arc<AppConfig>,
    state: Arc<AppState>,
    cache: Option<Arc<ProductCache>>,
}

impl App {
    fn build(config: AppConfig, park_registry: Arc<ParkRegistry>) -> Result<Self> {
        let metrics = Metrics::new().context("register metrics")?;
        let clock = SystemClock::shared();

        let store = match &config.store.catalog_file {
            Some(path) => MemoryStore::load(path, config.store.max_connections)
                .context("load product catalog")?,
            None => {
                warn!("no catalog file configured; serving an empty catalog");
                MemoryStore::new(Vec::new(), config.store.max_connections)
            }
        }
        .with_latency(Duration::from_millis(config.store.simulated_latency_ms));
        let store: Arc<dyn ProductStore> = Arc::new(store);

        let pool_size = config.effective_pool_size();
        let dispatcher = Arc::new(BoundedDispatcher::new(pool_size, Some(metrics.clone())));
        dispatcher.init(pool_size);

        let cache = config.cache.enabled.then(|| {
            Arc::new(ProductCache::new(
                config.cache.max_size,
                Arc::clone(&store),
                Arc::clone(&dispatcher),
                metrics.clone(),
                clock.clone(),
            ))
        });
        if cache.is_none() {
            warn!("product cache disabled; every lookup goes to the store");
        }

        let controller = Arc::new(AdmissionController::new(
            config.shedder.clone(),
            metrics.clone(),
            clock.clone(),
        ));
        let detector = Arc::new(StallDetector::new(
            config.monitor.clone(),
            Arc::new(ProcfsSampler::new(park_registry)),
            clock,
            Some(metrics.clone()),
        ));

        let state = Arc::new(AppState {
            products: ProductService::new(store, Arc::clone(&dispatcher), cache.clone()),
            controller,
            detector,
            dispatcher,
            metrics,
            readiness: AppReadiness::default(),
        });

        Ok(Self {
            config: Arc::new(config),
            state,
            cache,
        })
    }

    async fn run(&self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shedder_handle = self.state.controller.spawn(shutdown_rx.clone());
        self.state
            .detector
            .start()
            .context("start stall monitor")?;

        let api_router = create_api_router(Arc::clone(&self.state));
        let listener = tokio::net::TcpListener::bind(self.config.server.bind_addr)
            .await
            .with_context(|| format!("bind API server address {}", self.config.server.bind_addr))?;

        self.state.readiness.mark_ready();
        info!(
            address = %self.config.server.bind_addr,
            worker_threads = self.config.server.worker_threads,
            dispatcher_pool = self.state.dispatcher.stats().pool_size,
            shedding = self.config.shedder.enabled,
            cache = self.config.cache.enabled,
            "product lookup server online"
        );

        self.spawn_warmup();

        let mut server_shutdown = shutdown_rx.clone();
        let server_handle = tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                api_router.into_make_service_with_connect_info::<ConnectionToken>(),
            )
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "API server error");
            }
        });

        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let shedder = self.state.controller.status();
                    let blocking = self.state.detector.stats();
                    let dispatcher = self.state.dispatcher.stats();
                    info!(
                        shedding = shedder.shedding,
                        rejections = shedder.rejections_total,
                        blocking_events = blocking.total_blocking_events,
                        currently_blocked = blocking.currently_blocked,
                        dispatcher_busy = dispatcher.busy_workers,
                        dispatcher_queued = dispatcher.queued_jobs,
                        "lookup heartbeat"
                    );
                    if let Some(cache) = &self.cache {
                        let stats = cache.stats().await;
                        info!(
                            requests = stats.requests_total,
                            hit_percent = stats.cache_hit_percent,
                            size = stats.cache_size,
                            "cache statistics"
                        );
                    }
                }
                res = tokio::signal::ctrl_c() => {
                    if let Err(err) = res {
                        warn!(error = %err, "ctrl_c listener error");
                    }
                    info!("Shutdown signal received, exiting");
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(true);
        if let Err(err) = server_handle.await {
            warn!(error = %err, "API server task failed");
        }
        if let Some(handle) = shedder_handle {
            let _ = handle.await;
        }
        Ok(())
    }

    fn spawn_warmup(&self) {
        let warmup = &self.config.cache.warmup;
        let Some(cache) = self.cache.clone() else {
            return;
        };
        if !warmup.enabled {
            return;
        }
        let Some(path) = warmup.source_file.clone() else {
            warn!("cache warmup enabled without a source file; skipping");
            return;
        };
        cache.warmup_tracker().mark_pending();
        let limit = self.config.cache.max_size;
        let concurrency = warmup.concurrency;
        tokio::spawn(async move {
            let result = cache
                .warmup_from_file(&path, limit, concurrency, |_| {})
                .await;
            if let Err(err) = result {
                warn!(error = %format!("{err:#}"), "cache warmup failed");
            }
        });
    }

    /// Blocking teardown, run after the runtime stops serving.
    fn shutdown(&self) {
        self.state.detector.stop();
        self.state.dispatcher.shutdown();
    }
}

fn init_tracing() -> Result<()> {
    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,hyper=warn,tower_http=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("tracing subscriber init: {err}"))
}
