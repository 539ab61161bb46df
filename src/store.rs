// Product entity and the backing-store fetch capability
// The store is blocking by contract; callers on the request path must go
// through the bounded dispatcher rather than calling it from a runtime worker.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: i64,
    pub variant_sku: String,
    pub quantity: i32,
    pub price: f64,
    pub currency: String,
    pub attributes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub resolution: String,
    pub url: String,
    pub variant_id: Option<i64>,
}

/// Complete product detail as served by the lookup API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub base_sku: String,
    pub name: String,
    pub description: Option<String>,
    pub features: Option<String>,
    pub status: String,
    pub source: Option<String>,
    pub source_sku: Option<String>,
    pub source_url: Option<String>,
    pub attributes: Option<String>,
    pub category: Option<Category>,
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub media: Vec<Media>,
}

impl Product {
    /// Minimal product with only the required fields populated.
    pub fn named(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            base_sku: format!("SKU-{id}"),
            name: name.into(),
            description: None,
            features: None,
            status: "active".to_string(),
            source: None,
            source_sku: None,
            source_url: None,
            attributes: None,
            category: None,
            variants: Vec::new(),
            media: Vec::new(),
        }
    }
}

/// Fetch capability over the backing resource pool.
pub trait ProductStore: Send + Sync + 'static {
    /// Look up one product. `Ok(None)` means it does not exist.
    fn find_by_id(&self, id: i64) -> Result<Option<Product>>;

    /// Look up many products; absent ids are skipped, input order is kept.
    fn find_by_ids(&self, ids: &[i64]) -> Result<Vec<Product>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(product) = self.find_by_id(*id)? {
                out.push(product);
            }
        }
        Ok(out)
    }

    /// Whether the backing resource is reachable.
    fn ping(&self) -> bool {
        true
    }

    /// Maximum concurrent operations the backing resource can serve.
    fn max_connections(&self) -> usize;
}

/// In-memory catalog loaded from a JSON array of products.
///
/// `simulated_latency` is slept on every lookup, standing in for the round
/// trip to a real database so the dispatcher and shedder see realistic load.
pub struct MemoryStore {
    products: HashMap<i64, Product>,
    simulated_latency: Duration,
    max_connections: usize,
}

impl MemoryStore {
    pub fn new(products: impl IntoIterator<Item = Product>, max_connections: usize) -> Self {
        Self {
            products: products.into_iter().map(|p| (p.id, p)).collect(),
            simulated_latency: Duration::ZERO,
            max_connections: max_connections.max(1),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.simulated_latency = latency;
        self
    }

    /// Load the catalog file. Blocking; call it before serving or on the dispatcher.
    pub fn load(path: &Path, max_connections: usize) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read catalog file {}", path.display()))?;
        let products: Vec<Product> = serde_json::from_str(&raw)
            .with_context(|| format!("parse catalog file {}", path.display()))?;
        info!(path = %path.display(), products = products.len(), "catalog loaded");
        Ok(Self::new(products, max_connections))
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

impl ProductStore for MemoryStore {
    fn find_by_id(&self, id: i64) -> Result<Option<Product>> {
        if !self.simulated_latency.is_zero() {
            std::thread::sleep(self.simulated_latency);
        }
        Ok(self.products.get(&id).cloned())
    }

    fn max_connections(&self) -> usize {
        self.max_connections
    }
}
