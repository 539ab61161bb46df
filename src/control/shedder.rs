// Admission controller: load shedding with hysteresis
//
// A periodic check reads the sliding window and derives rps and timeout rate.
// TC consecutive satisfied checks turn shedding on; CC consecutive unsatisfied
// checks while shedding turn it off. The evaluation loop is the only writer of
// the flag and the run counters; the request gate only reads them.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::ShedderConfig;
use crate::control::window::SlidingWindow;
use crate::metrics::Metrics;

/// Result of one check over the window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CheckResult {
    pub rps: f64,
    pub timeout_percent: f64,
    pub total: u64,
    pub over_threshold: u64,
}

/// What one evaluation tick did to the shedding state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Entered,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub check: CheckResult,
    pub satisfied: bool,
    pub shedding: bool,
    pub transition: Transition,
}

/// Gate decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Not governed: excluded path, or shedding disabled. Nothing is recorded.
    PassThrough,
    /// Admitted; its completion must be recorded exactly once.
    Admitted,
    /// Rejected with 503 before any work started.
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShedderStatus {
    pub enabled: bool,
    pub shedding: bool,
    pub consecutive_satisfied: u32,
    pub consecutive_unsatisfied: u32,
    pub rejections_total: u64,
    pub window_seconds: u64,
}

pub struct AdmissionController {
    config: ShedderConfig,
    window: SlidingWindow,
    excluded: HashSet<String>,
    shedding: AtomicBool,
    consecutive_satisfied: AtomicU32,
    consecutive_unsatisfied: AtomicU32,
    rejections: AtomicU64,
    metrics: Metrics,
    clock: SharedClock,
}

impl AdmissionController {
    pub fn new(config: ShedderConfig, metrics: Metrics, clock: SharedClock) -> Self {
        let window = SlidingWindow::new(
            config.recent_time_window_seconds,
            config.response_time_threshold_ms,
            clock.clone(),
        );
        let excluded = config.excluded_paths.iter().cloned().collect();
        Self {
            config,
            window,
            excluded,
            shedding: AtomicBool::new(false),
            consecutive_satisfied: AtomicU32::new(0),
            consecutive_unsatisfied: AtomicU32::new(0),
            rejections: AtomicU64::new(0),
            metrics,
            clock,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_shedding(&self) -> bool {
        self.shedding.load(Ordering::Acquire)
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded.contains(path)
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Decide whether a request on `path` may proceed.
    pub fn admit(&self, path: &str) -> Admission {
        if !self.config.enabled || self.is_excluded(path) {
            return Admission::PassThrough;
        }
        if self.is_shedding() {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            self.metrics.shedding_rejections_total.inc();
            debug!(path, "request rejected while shedding");
            return Admission::Rejected;
        }
        Admission::Admitted
    }

    /// Record a finished admitted request.
    pub fn record_completion(&self, duration_ms: u64) {
        self.window.record_completion(duration_ms);
    }

    pub fn window(&self) -> &SlidingWindow {
        &self.window
    }

    /// Read the window and compute rps and timeout rate.
    pub fn check(&self) -> CheckResult {
        let sum = self.window.sum();
        let rps = sum.total as f64 / self.window.rtw_seconds() as f64;
        let timeout_percent = if sum.total == 0 {
            0.0
        } else {
            sum.over_threshold as f64 * 100.0 / sum.total as f64
        };
        CheckResult {
            rps,
            timeout_percent,
            total: sum.total,
            over_threshold: sum.over_threshold,
        }
    }

    fn is_satisfied(&self, check: &CheckResult) -> bool {
        check.rps >= self.config.high_traffic_threshold_rps as f64
            && check.timeout_percent >= self.config.timeout_rate_percent
    }

    /// One evaluation tick. Must only be called from a single task.
    pub fn evaluate(&self) -> Evaluation {
        let check = self.check();
        let satisfied = self.is_satisfied(&check);
        let mut transition = Transition::None;

        if satisfied {
            let prev = self.consecutive_satisfied.load(Ordering::Acquire);
            let now = prev.saturating_add(1);
            self.consecutive_satisfied.store(now, Ordering::Release);
            self.consecutive_unsatisfied.store(0, Ordering::Release);
            if prev == 0 {
                warn!(
                    rps = check.rps,
                    timeout_percent = check.timeout_percent,
                    threshold_rps = self.config.high_traffic_threshold_rps,
                    threshold_percent = self.config.timeout_rate_percent,
                    "high load condition satisfied"
                );
            }
            if now >= self.config.trigger_consecutive_checks
                && !self.shedding.swap(true, Ordering::AcqRel)
            {
                transition = Transition::Entered;
                warn!(
                    consecutive = now,
                    rps = check.rps,
                    timeout_percent = check.timeout_percent,
                    "load shedding activated"
                );
            }
        } else {
            self.consecutive_satisfied.store(0, Ordering::Release);
            if self.shedding.load(Ordering::Acquire) {
                let unsat = self.consecutive_unsatisfied.load(Ordering::Acquire) + 1;
                if unsat >= self.config.cooldown_consecutive_checks {
                    self.shedding.store(false, Ordering::Release);
                    self.consecutive_unsatisfied.store(0, Ordering::Release);
                    transition = Transition::Exited;
                    info!(
                        consecutive = unsat,
                        rps = check.rps,
                        timeout_percent = check.timeout_percent,
                        "load shedding deactivated"
                    );
                } else {
                    self.consecutive_unsatisfied.store(unsat, Ordering::Release);
                }
            }
        }

        let shedding = self.is_shedding();
        self.metrics.shedding_active.set(shedding as i64);
        self.metrics
            .consecutive_satisfied
            .set(self.consecutive_satisfied.load(Ordering::Acquire) as i64);
        self.metrics
            .consecutive_unsatisfied
            .set(self.consecutive_unsatisfied.load(Ordering::Acquire) as i64);

        Evaluation {
            check,
            satisfied,
            shedding,
            transition,
        }
    }

    pub fn status(&self) -> ShedderStatus {
        ShedderStatus {
            enabled: self.config.enabled,
            shedding: self.is_shedding(),
            consecutive_satisfied: self.consecutive_satisfied.load(Ordering::Acquire),
            consecutive_unsatisfied: self.consecutive_unsatisfied.load(Ordering::Acquire),
            rejections_total: self.rejections.load(Ordering::Relaxed),
            window_seconds: self.window.rtw_seconds(),
        }
    }

    /// Evaluate every `check_interval_seconds` until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.check_interval_seconds.max(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_s = period.as_secs(),
            window_s = self.window.rtw_seconds(),
            threshold_rps = self.config.high_traffic_threshold_rps,
            threshold_percent = self.config.timeout_rate_percent,
            response_threshold_ms = self.config.response_time_threshold_ms,
            trigger = self.config.trigger_consecutive_checks,
            cooldown = self.config.cooldown_consecutive_checks,
            "load shedder started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let eval = self.evaluate();
                    debug!(
                        rps = eval.check.rps,
                        timeout_percent = eval.check.timeout_percent,
                        satisfied = eval.satisfied,
                        shedding = eval.shedding,
                        "shedder check"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("load shedder stopped");
    }

    /// Spawn the evaluation loop. Returns `None` when shedding is disabled.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            info!("load shedding disabled");
            return None;
        }
        Some(tokio::spawn(Arc::clone(self).run(shutdown)))
    }
}
