// Read-through product cache
//
// Hits are served from memory. Misses go to the store through the bounded
// dispatcher and only found products are inserted; "not found" is never
// cached, so a product created later becomes visible on the next lookup.

use std::sync::Arc;

use moka::future::Cache;
use serde::Serialize;
use tracing::debug;

use crate::cache::warmup::{WarmupStats, WarmupTracker};
use crate::clock::SharedClock;
use crate::dispatch::BoundedDispatcher;
use crate::errors::LookupError;
use crate::metrics::Metrics;
use crate::store::{Product, ProductStore};

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub requests_total: u64,
    pub cache_hits_total: u64,
    pub backend_hits_total: u64,
    pub cache_hit_percent: f64,
    pub uptime_ms: u64,
    pub cache_size: u64,
    pub max_size: u64,
    pub warmup: Option<WarmupStats>,
    pub warmup_complete: bool,
}

impl CacheStats {
    /// Zeroed form reported when the cache is turned off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            requests_total: 0,
            cache_hits_total: 0,
            backend_hits_total: 0,
            cache_hit_percent: 0.0,
            uptime_ms: 0,
            cache_size: 0,
            max_size: 0,
            warmup: None,
            warmup_complete: true,
        }
    }
}

pub struct ProductCache {
    pub(crate) cache: Cache<i64, Arc<Product>>,
    pub(crate) store: Arc<dyn ProductStore>,
    pub(crate) dispatcher: Arc<BoundedDispatcher>,
    pub(crate) warmup: WarmupTracker,
    metrics: Metrics,
    max_size: u64,
    pub(crate) clock: SharedClock,
    started_ms: u64,
}

impl ProductCache {
    pub fn new(
        max_size: u64,
        store: Arc<dyn ProductStore>,
        dispatcher: Arc<BoundedDispatcher>,
        metrics: Metrics,
        clock: SharedClock,
    ) -> Self {
        let started_ms = clock.now_ms();
        Self {
            cache: Cache::builder().max_capacity(max_size).build(),
            store,
            dispatcher,
            warmup: WarmupTracker::default(),
            metrics,
            max_size,
            clock,
            started_ms,
        }
    }

    /// Cached lookup; a miss fetches through the dispatcher.
    pub async fn get(&self, id: i64) -> Result<Option<Arc<Product>>, LookupError> {
        self.metrics.requests_total.inc();
        if let Some(hit) = self.cache.get(&id).await {
            self.metrics.cache_hits_total.inc();
            return Ok(Some(hit));
        }
        self.metrics.backend_hits_total.inc();
        debug!(id, "cache miss");

        match self.fetch(id).await? {
            Some(product) => {
                let product = Arc::new(product);
                self.cache.insert(id, Arc::clone(&product)).await;
                Ok(Some(product))
            }
            None => Ok(None),
        }
    }

    /// Fetch from the store on the dispatcher, bypassing the cache.
    pub(crate) async fn fetch(&self, id: i64) -> Result<Option<Product>, LookupError> {
        let store = Arc::clone(&self.store);
        self.dispatcher
            .run(move || store.find_by_id(id))
            .await?
            .map_err(|err| LookupError::Backend(format!("{err:#}")))
    }

    pub async fn contains(&self, id: i64) -> bool {
        self.cache.get(&id).await.is_some()
    }

    pub async fn size(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn warmup_tracker(&self) -> &WarmupTracker {
        &self.warmup
    }

    pub async fn stats(&self) -> CacheStats {
        let requests = self.metrics.requests_total.get();
        let hits = self.metrics.cache_hits_total.get();
        let hit_percent = if requests == 0 {
            0.0
        } else {
            hits as f64 * 100.0 / requests as f64
        };
        CacheStats {
            enabled: true,
            requests_total: requests,
            cache_hits_total: hits,
            backend_hits_total: self.metrics.backend_hits_total.get(),
            cache_hit_percent: hit_percent,
            uptime_ms: self.clock.now_ms().saturating_sub(self.started_ms),
            cache_size: self.size().await,
            max_size: self.max_size,
            warmup: self.warmup.result(),
            warmup_complete: self.warmup.is_complete(),
        }
    }
}
