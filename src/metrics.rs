// Metrics and observability module
// Owns the Prometheus registry for one server instance and every counter and
// gauge the governance components update.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Open client connections. Process-wide because the accept path has no
/// injected state; every `Metrics` registry exports the same gauge.
pub static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("active_connections", "open client connections").unwrap()
});

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub requests_total: IntCounter,
    pub cache_hits_total: IntCounter,
    pub backend_hits_total: IntCounter,
    pub shedding_rejections_total: IntCounter,
    pub blocking_events_total: IntCounter,
    pub shedding_active: IntGauge,
    pub consecutive_satisfied: IntGauge,
    pub consecutive_unsatisfied: IntGauge,
    pub in_flight_requests: IntGauge,
    pub dispatcher_queue_depth: IntGauge,
    pub dispatcher_busy_workers: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::new(name, help).with_context(|| format!("define counter {name}"))?;
            registry
                .register(Box::new(c.clone()))
                .with_context(|| format!("register counter {name}"))?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let g = IntGauge::new(name, help).with_context(|| format!("define gauge {name}"))?;
            registry
                .register(Box::new(g.clone()))
                .with_context(|| format!("register gauge {name}"))?;
            Ok(g)
        };

        let metrics = Self {
            requests_total: counter("requests_total", "lookups served through the product cache")?,
            cache_hits_total: counter("cache_hits_total", "lookups answered from the cache")?,
            backend_hits_total: counter("backend_hits_total", "lookups that went to the backing store")?,
            shedding_rejections_total: counter(
                "shedding_rejections_total",
                "requests rejected with 503 while shedding",
            )?,
            blocking_events_total: counter(
                "blocking_events_total",
                "warning or critical stall alerts raised for runtime workers",
            )?,
            shedding_active: gauge("shedding_active", "1 while shedding, 0 otherwise")?,
            consecutive_satisfied: gauge(
                "consecutive_satisfied",
                "consecutive checks that satisfied the high-load condition",
            )?,
            consecutive_unsatisfied: gauge(
                "consecutive_unsatisfied",
                "consecutive unsatisfied checks while shedding",
            )?,
            in_flight_requests: gauge("in_flight_requests", "requests currently being handled")?,
            dispatcher_queue_depth: gauge(
                "dispatcher_queue_depth",
                "jobs waiting for a dispatcher worker",
            )?,
            dispatcher_busy_workers: gauge(
                "dispatcher_busy_workers",
                "dispatcher workers currently running a job",
            )?,
            registry,
        };

        metrics
            .registry
            .register(Box::new(ACTIVE_CONNECTIONS.clone()))
            .context("register gauge active_connections")?;

        Ok(metrics)
    }

    /// Render every registered metric in Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .context("encode prometheus metrics")?;
        String::from_utf8(buf).context("prometheus output is not utf-8")
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
