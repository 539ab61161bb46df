// Product cache and startup warmup

pub mod product;
pub mod warmup;

pub use product::{CacheStats, ProductCache};
pub use warmup::{read_product_ids, WarmupProgress, WarmupStats, WarmupTracker};
