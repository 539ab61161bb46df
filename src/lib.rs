// Library root module for product-lookup
// Declares the runtime governance components (admission control, stall
// monitoring, bounded dispatch, read-through cache) and the HTTP surface
// that wires them together.

pub mod cache;
pub mod clock;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod errors;
pub mod metrics;
pub mod monitor;
pub mod router;
pub mod service;
pub mod state;
pub mod store;
