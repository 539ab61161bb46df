// Configuration management module
// Loads settings from an optional config file (path in LOOKUP_CONFIG) and
// LOOKUP__SECTION__KEY environment variables. Every option has a default; a
// value that is present but malformed falls back to it with a warning.

use anyhow::{Context, Result};
use config::{Config, ConfigError};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::warn;

pub const DEFAULT_EXCLUDED_PATHS: [&str; 3] = ["/health", "/ready", "/metrics"];
pub const DEFAULT_WORKER_THREAD_NAME: &str = "lookup-worker";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub shedder: ShedderConfig,
    pub monitor: MonitorConfig,
    pub dispatcher: DispatcherConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Runtime worker threads (the non-blocking pool)
    pub worker_threads: usize,
    /// Name given to runtime worker threads; the stall monitor matches on it
    pub worker_thread_name: String,
}

/// High-load shedder settings.
/// RTW = recent time window, HTT = high traffic threshold, TOR = timeout rate,
/// TC / CC = consecutive checks to trigger / cool down.
#[derive(Debug, Clone)]
pub struct ShedderConfig {
    pub enabled: bool,
    pub recent_time_window_seconds: u32,
    pub high_traffic_threshold_rps: u32,
    pub timeout_rate_percent: f64,
    pub response_time_threshold_ms: u64,
    pub check_interval_seconds: u64,
    pub trigger_consecutive_checks: u32,
    pub cooldown_consecutive_checks: u32,
    pub excluded_paths: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    pub warning_threshold_ms: u64,
    pub critical_threshold_ms: u64,
    pub stack_trace_on_warning: bool,
    /// Case-insensitive substrings identifying protected worker threads
    pub worker_patterns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub pool_size: usize,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_size: u64,
    pub warmup: WarmupConfig,
}

#[derive(Debug, Clone)]
pub struct WarmupConfig {
    pub enabled: bool,
    pub source_file: Option<PathBuf>,
    /// Ceiling on simultaneous warmup fetches
    pub concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub catalog_file: Option<PathBuf>,
    pub simulated_latency_ms: u64,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            worker_threads: default_worker_threads(),
            worker_thread_name: DEFAULT_WORKER_THREAD_NAME.to_string(),
        }
    }
}

impl Default for ShedderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            recent_time_window_seconds: 12,
            high_traffic_threshold_rps: 500,
            timeout_rate_percent: 1.0,
            response_time_threshold_ms: 3000,
            check_interval_seconds: 1,
            trigger_consecutive_checks: 3,
            cooldown_consecutive_checks: 3,
            excluded_paths: DEFAULT_EXCLUDED_PATHS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 100,
            warning_threshold_ms: 50,
            critical_threshold_ms: 200,
            stack_trace_on_warning: true,
            worker_patterns: vec![DEFAULT_WORKER_THREAD_NAME.to_string()],
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { pool_size: 50 }
    }
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source_file: None,
            concurrency: 50,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 1_000_000,
            warmup: WarmupConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            catalog_file: None,
            simulated_latency_ms: 0,
            max_connections: 50,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();
        if let Ok(path) = std::env::var("LOOKUP_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }
        let cfg = builder
            .add_source(config::Environment::with_prefix("LOOKUP").separator("__"))
            .build()
            .context("build configuration sources")?;
        Ok(Self::from_source(&cfg))
    }

    /// Resolve every option from an already-built source, applying defaults.
    pub fn from_source(cfg: &Config) -> Self {
        let server_default = ServerConfig::default();
        let bind_addr = match cfg.get_string("server.bind_addr") {
            Ok(raw) => raw.parse().unwrap_or_else(|err| {
                warn!(key = "server.bind_addr", value = %raw, error = %err, "invalid setting; using default");
                server_default.bind_addr
            }),
            Err(_) => server_default.bind_addr,
        };
        let server = ServerConfig {
            bind_addr,
            worker_threads: positive(cfg, "server.worker_threads", server_default.worker_threads),
            worker_thread_name: setting(
                cfg,
                "server.worker_thread_name",
                server_default.worker_thread_name,
            ),
        };

        let sd = ShedderConfig::default();
        let excluded_paths = string_list(cfg, "shedder.excluded_paths");
        let shedder = ShedderConfig {
            enabled: setting(cfg, "shedder.enabled", sd.enabled),
            recent_time_window_seconds: positive(
                cfg,
                "shedder.recent_time_window_seconds",
                sd.recent_time_window_seconds,
            ),
            high_traffic_threshold_rps: positive(
                cfg,
                "shedder.high_traffic_threshold_rps",
                sd.high_traffic_threshold_rps,
            ),
            timeout_rate_percent: positive(cfg, "shedder.timeout_rate_percent", sd.timeout_rate_percent),
            response_time_threshold_ms: positive(
                cfg,
                "shedder.response_time_threshold_ms",
                sd.response_time_threshold_ms,
            ),
            check_interval_seconds: positive(cfg, "shedder.check_interval_seconds", sd.check_interval_seconds),
            trigger_consecutive_checks: positive(
                cfg,
                "shedder.trigger_consecutive_checks",
                sd.trigger_consecutive_checks,
            ),
            cooldown_consecutive_checks: positive(
                cfg,
                "shedder.cooldown_consecutive_checks",
                sd.cooldown_consecutive_checks,
            ),
            excluded_paths: if excluded_paths.is_empty() {
                sd.excluded_paths
            } else {
                excluded_paths
            },
        };

        let md = MonitorConfig::default();
        let patterns = string_list(cfg, "monitor.worker_patterns");
        let monitor = MonitorConfig {
            enabled: setting(cfg, "monitor.enabled", md.enabled),
            check_interval_ms: positive(cfg, "monitor.check_interval_ms", md.check_interval_ms),
            warning_threshold_ms: positive(cfg, "monitor.warning_threshold_ms", md.warning_threshold_ms),
            critical_threshold_ms: positive(cfg, "monitor.critical_threshold_ms", md.critical_threshold_ms),
            stack_trace_on_warning: setting(cfg, "monitor.stack_trace_on_warning", md.stack_trace_on_warning),
            worker_patterns: if patterns.is_empty() {
                vec![server.worker_thread_name.clone()]
            } else {
                patterns
            },
        };

        let store_default = StoreConfig::default();
        let store = StoreConfig {
            catalog_file: optional_path(cfg, "store.catalog_file"),
            simulated_latency_ms: setting(cfg, "store.simulated_latency_ms", store_default.simulated_latency_ms),
            max_connections: positive(cfg, "store.max_connections", store_default.max_connections),
        };

        let dispatcher = DispatcherConfig {
            pool_size: positive(cfg, "dispatcher.pool_size", DispatcherConfig::default().pool_size),
        };

        let cd = CacheConfig::default();
        let cache = CacheConfig {
            enabled: setting(cfg, "cache.enabled", cd.enabled),
            max_size: positive(cfg, "cache.max_size", cd.max_size),
            warmup: WarmupConfig {
                enabled: setting(cfg, "cache.warmup.enabled", cd.warmup.enabled),
                source_file: optional_path(cfg, "cache.warmup.source_file"),
                concurrency: positive(cfg, "cache.warmup.concurrency", cd.warmup.concurrency),
            },
        };

        Self {
            server,
            shedder,
            monitor,
            dispatcher,
            cache,
            store,
        }
    }

    /// Dispatcher size capped at what the backing store can serve concurrently.
    pub fn effective_pool_size(&self) -> usize {
        if self.dispatcher.pool_size > self.store.max_connections {
            warn!(
                pool_size = self.dispatcher.pool_size,
                max_connections = self.store.max_connections,
                "dispatcher pool larger than store connections; clamping"
            );
            self.store.max_connections
        } else {
            self.dispatcher.pool_size
        }
    }
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn setting<T: DeserializeOwned + Debug>(cfg: &Config, key: &str, default: T) -> T {
    match cfg.get::<T>(key) {
        Ok(value) => value,
        Err(ConfigError::NotFound(_)) => default,
        Err(err) => {
            warn!(key = key, error = %err, default = ?default, "invalid setting; using default");
            default
        }
    }
}

/// Like `setting`, but zero and negative values also fall back to the default.
fn positive<T>(cfg: &Config, key: &str, default: T) -> T
where
    T: DeserializeOwned + Debug + PartialOrd + Default + Clone,
{
    let value = setting(cfg, key, default.clone());
    if value <= T::default() {
        warn!(key = key, value = ?value, default = ?default, "non-positive setting; using default");
        default
    } else {
        value
    }
}

/// Accepts either a real list or a comma-separated string.
fn string_list(cfg: &Config, key: &str) -> Vec<String> {
    let raw: Vec<String> = match cfg.get::<Vec<String>>(key) {
        Ok(list) => list,
        Err(_) => match cfg.get_string(key) {
            Ok(joined) => joined.split(',').map(str::to_string).collect(),
            Err(_) => Vec::new(),
        },
    };
    raw.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn optional_path(cfg: &Config, key: &str) -> Option<PathBuf> {
    cfg.get_string(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(pairs: &[(&str, &str)]) -> AppConfig {
        let mut builder = Config::builder();
        for (k, v) in pairs {
            builder = builder.set_override(*k, *v).unwrap();
        }
        AppConfig::from_source(&builder.build().unwrap())
    }

    #[test]
    fn empty_source_yields_documented_defaults() {
        let cfg = build(&[]);
        assert!(!cfg.shedder.enabled);
        assert_eq!(cfg.shedder.recent_time_window_seconds, 12);
        assert_eq!(cfg.shedder.high_traffic_threshold_rps, 500);
        assert_eq!(cfg.shedder.timeout_rate_percent, 1.0);
        assert_eq!(cfg.shedder.response_time_threshold_ms, 3000);
        assert_eq!(cfg.shedder.check_interval_seconds, 1);
        assert_eq!(cfg.shedder.trigger_consecutive_checks, 3);
        assert_eq!(cfg.shedder.cooldown_consecutive_checks, 3);
        assert_eq!(cfg.shedder.excluded_paths, vec!["/health", "/ready", "/metrics"]);
        assert_eq!(cfg.monitor.check_interval_ms, 100);
        assert_eq!(cfg.monitor.warning_threshold_ms, 50);
        assert_eq!(cfg.monitor.critical_threshold_ms, 200);
        assert!(cfg.monitor.stack_trace_on_warning);
        assert_eq!(cfg.cache.max_size, 1_000_000);
        assert!(!cfg.cache.warmup.enabled);
        assert!(cfg.cache.warmup.source_file.is_none());
    }

    #[test]
    fn malformed_numbers_fall_back_to_defaults() {
        let cfg = build(&[
            ("shedder.recent_time_window_seconds", "twelve"),
            ("shedder.timeout_rate_percent", "lots"),
            ("shedder.high_traffic_threshold_rps", "0"),
            ("monitor.warning_threshold_ms", "-5"),
            ("shedder.trigger_consecutive_checks", "5"),
        ]);
        assert_eq!(cfg.shedder.recent_time_window_seconds, 12);
        assert_eq!(cfg.shedder.timeout_rate_percent, 1.0);
        assert_eq!(cfg.shedder.high_traffic_threshold_rps, 500);
        assert_eq!(cfg.monitor.warning_threshold_ms, 50);
        assert_eq!(cfg.shedder.trigger_consecutive_checks, 5);
    }

    #[test]
    fn excluded_paths_accept_comma_separated_string() {
        let cfg = build(&[("shedder.excluded_paths", " /health , /live,, ")]);
        assert_eq!(cfg.shedder.excluded_paths, vec!["/health", "/live"]);

        let blank = build(&[("shedder.excluded_paths", "  ")]);
        assert_eq!(blank.shedder.excluded_paths, vec!["/health", "/ready", "/metrics"]);
    }

    #[test]
    fn pool_size_is_clamped_to_store_connections() {
        let cfg = build(&[("dispatcher.pool_size", "80"), ("store.max_connections", "20")]);
        assert_eq!(cfg.effective_pool_size(), 20);

        let fits = build(&[("dispatcher.pool_size", "16"), ("store.max_connections", "20")]);
        assert_eq!(fits.effective_pool_size(), 16);
    }

    #[test]
    fn warmup_source_file_is_read() {
        let cfg = build(&[
            ("cache.warmup.enabled", "true"),
            ("cache.warmup.source_file", "/tmp/ids.txt"),
        ]);
        assert!(cfg.cache.warmup.enabled);
        assert_eq!(cfg.cache.warmup.source_file, Some(PathBuf::from("/tmp/ids.txt")));
    }
}
