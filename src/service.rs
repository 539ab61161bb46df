// Product lookup service used by the HTTP handlers
//
// Single lookups go through the read-through cache when it is enabled. Batch
// lookups always hit the store, on the dispatcher, in one job. The health
// ping stays off the dispatcher queue so probes never wait behind lookups.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::cache::ProductCache;
use crate::dispatch::BoundedDispatcher;
use crate::errors::LookupError;
use crate::store::{Product, ProductStore};

/// Largest accepted batch.
pub const MAX_BATCH_IDS: usize = 50;

/// Longest a health ping may take before the store reads as down.
pub const PING_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ProductService {
    store: Arc<dyn ProductStore>,
    dispatcher: Arc<BoundedDispatcher>,
    cache: Option<Arc<ProductCache>>,
    ping_timeout: Duration,
}

impl ProductService {
    pub fn new(
        store: Arc<dyn ProductStore>,
        dispatcher: Arc<BoundedDispatcher>,
        cache: Option<Arc<ProductCache>>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            cache,
            ping_timeout: PING_TIMEOUT,
        }
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn cache(&self) -> Option<&Arc<ProductCache>> {
        self.cache.as_ref()
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Arc<Product>>, LookupError> {
        if let Some(cache) = &self.cache {
            return cache.get(id).await;
        }
        let store = Arc::clone(&self.store);
        let found = self
            .dispatcher
            .run(move || store.find_by_id(id))
            .await?
            .map_err(|err| LookupError::Backend(format!("{err:#}")))?;
        Ok(found.map(Arc::new))
    }

    /// Uncached batch lookup; absent ids are skipped, input order is kept.
    pub async fn get_by_ids(&self, ids: Vec<i64>) -> Result<Vec<Product>, LookupError> {
        let store = Arc::clone(&self.store);
        self.dispatcher
            .run(move || store.find_by_ids(&ids))
            .await?
            .map_err(|err| LookupError::Backend(format!("{err:#}")))
    }

    /// Store reachability. The ping runs on the runtime's blocking pool, not
    /// the lookup queue; a ping that fails, panics or times out reads as down.
    pub async fn db_connected(&self) -> bool {
        let store = Arc::clone(&self.store);
        let ping = tokio::task::spawn_blocking(move || store.ping());
        match tokio::time::timeout(self.ping_timeout, ping).await {
            Ok(Ok(up)) => up,
            Ok(Err(err)) => {
                warn!(error = %err, "store ping task failed");
                false
            }
            Err(_) => {
                warn!(timeout_ms = self.ping_timeout.as_millis() as u64, "store ping timed out");
                false
            }
        }
    }
}
