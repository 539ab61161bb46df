// HTTP surface of the lookup server
// Product endpoints, health and readiness probes, Prometheus metrics and
// monitor endpoints over the governance components.

pub mod monitor;
pub mod products;

#[allow(clippy::module_inception)]
pub mod router;

pub use router::{create_api_router, ConnectionToken};
