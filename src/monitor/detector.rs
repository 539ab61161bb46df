// Stall detector for non-blocking runtime workers
//
// Samples threads on a fixed interval from its own OS thread and tracks each
// protected worker through blocking episodes. An episode raises at most one
// warning and one critical alert; the flags reset when the worker runs again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::clock::SharedClock;
use crate::config::MonitorConfig;
use crate::metrics::Metrics;
use crate::monitor::sampler::{NamePatterns, WaitState, WorkerSampler, WorkerSnapshot};

const MAX_TRACE_LINES: usize = 20;

/// Tracking record for one protected worker.
#[derive(Debug, Clone)]
pub struct WorkerSample {
    pub id: u64,
    pub name: String,
    pub state: WaitState,
    pub blocking_start_ms: Option<u64>,
    pub warning_logged: bool,
    pub critical_logged: bool,
    pub last_trace: Vec<String>,
}

impl WorkerSample {
    fn new(snapshot: &WorkerSnapshot) -> Self {
        Self {
            id: snapshot.id,
            name: snapshot.name.clone(),
            state: WaitState::Runnable,
            blocking_start_ms: None,
            warning_logged: false,
            critical_logged: false,
            last_trace: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// One alert raised by a sampling pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallAlert {
    pub level: AlertLevel,
    pub worker_id: u64,
    pub worker_name: String,
    pub state: WaitState,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StallStats {
    pub uptime_ms: u64,
    pub total_blocking_events: u64,
    pub total_blocking_time_ms: u64,
    pub monitored_workers: usize,
    pub currently_blocked: usize,
    pub avg_blocking_time_per_event: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorStatus {
    Healthy,
    OkWithBlocking,
    Warning,
    Degraded,
}

impl MonitorStatus {
    pub fn from_stats(stats: &StallStats) -> Self {
        if stats.currently_blocked > 0 {
            MonitorStatus::Degraded
        } else if stats.total_blocking_events > 100 && stats.avg_blocking_time_per_event > 100 {
            MonitorStatus::Warning
        } else if stats.total_blocking_events > 0 {
            MonitorStatus::OkWithBlocking
        } else {
            MonitorStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: u64,
    pub name: String,
    pub state: WaitState,
    pub is_monitored: bool,
}

struct Running {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct StallDetector {
    config: MonitorConfig,
    sampler: Arc<dyn WorkerSampler>,
    patterns: NamePatterns,
    clock: SharedClock,
    metrics: Option<Metrics>,
    workers: DashMap<u64, WorkerSample>,
    total_blocking_events: AtomicU64,
    total_blocking_time_ms: AtomicU64,
    started_ms: AtomicU64,
    sampling: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl StallDetector {
    pub fn new(
        config: MonitorConfig,
        sampler: Arc<dyn WorkerSampler>,
        clock: SharedClock,
        metrics: Option<Metrics>,
    ) -> Self {
        let patterns = NamePatterns::new(&config.worker_patterns);
        let started_ms = clock.now_ms();
        Self {
            config,
            sampler,
            patterns,
            clock,
            metrics,
            workers: DashMap::new(),
            total_blocking_events: AtomicU64::new(0),
            total_blocking_time_ms: AtomicU64::new(0),
            started_ms: AtomicU64::new(started_ms),
            sampling: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    /// Start the sampling thread. A second call while running is ignored.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if !self.config.enabled {
            info!("stall monitor disabled");
            return Ok(());
        }
        let mut running = self.running.lock();
        if running.is_some() {
            warn!("stall monitor already running");
            return Ok(());
        }
        self.started_ms.store(self.clock.now_ms(), Ordering::Release);

        let (stop, stop_rx) = mpsc::channel::<()>();
        let interval = Duration::from_millis(self.config.check_interval_ms.max(1));
        let detector = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("stall-monitor".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        detector.tick();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .context("spawn stall-monitor thread")?;
        *running = Some(Running { stop, handle });
        self.sampling.store(true, Ordering::Release);

        info!(
            interval_ms = self.config.check_interval_ms,
            warning_ms = self.config.warning_threshold_ms,
            critical_ms = self.config.critical_threshold_ms,
            patterns = ?self.patterns.patterns(),
            "stall monitor started"
        );
        Ok(())
    }

    /// Stop sampling and log a summary. Cumulative counters are kept.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        let _ = running.stop.send(());
        if running.handle.join().is_err() {
            error!("stall-monitor thread panicked");
        }
        self.sampling.store(false, Ordering::Release);
        let stats = self.stats();
        info!(
            uptime_ms = stats.uptime_ms,
            blocking_events = stats.total_blocking_events,
            blocking_time_ms = stats.total_blocking_time_ms,
            "stall monitor stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.sampling.load(Ordering::Acquire)
    }

    /// One sampling pass. Sampler errors are logged and skipped.
    pub fn tick(&self) -> Vec<StallAlert> {
        let now = self.clock.now_ms();
        match self.sampler.sample(true) {
            Ok(snapshots) => self.process(&snapshots, now),
            Err(err) => {
                error!(error = %format!("{err:#}"), "stall monitor sampling failed");
                Vec::new()
            }
        }
    }

    /// Apply one pass of snapshots taken at `now_ms`.
    pub fn process(&self, snapshots: &[WorkerSnapshot], now_ms: u64) -> Vec<StallAlert> {
        let mut alerts = Vec::new();
        let mut seen = Vec::with_capacity(snapshots.len());

        for snap in snapshots.iter().filter(|s| self.patterns.matches(&s.name)) {
            seen.push(snap.id);
            let mut sample = self
                .workers
                .entry(snap.id)
                .or_insert_with(|| WorkerSample::new(snap));
            sample.name.clone_from(&snap.name);

            match (snap.state.is_blocking(), sample.blocking_start_ms) {
                (true, None) => {
                    sample.blocking_start_ms = Some(now_ms);
                    sample.warning_logged = false;
                    sample.critical_logged = false;
                    sample.last_trace = snap.trace.clone();
                }
                (true, Some(start)) => {
                    let duration = now_ms.saturating_sub(start);
                    if !snap.trace.is_empty() {
                        sample.last_trace = snap.trace.clone();
                    }
                    let level = if duration >= self.config.critical_threshold_ms
                        && !sample.critical_logged
                    {
                        sample.critical_logged = true;
                        // a critical alert covers the warning for this episode
                        sample.warning_logged = true;
                        Some(AlertLevel::Critical)
                    } else if duration >= self.config.warning_threshold_ms
                        && !sample.warning_logged
                    {
                        sample.warning_logged = true;
                        Some(AlertLevel::Warning)
                    } else {
                        None
                    };
                    if let Some(level) = level {
                        self.total_blocking_events.fetch_add(1, Ordering::AcqRel);
                        if let Some(m) = &self.metrics {
                            m.blocking_events_total.inc();
                        }
                        self.log_alert(level, &sample, snap.state, duration);
                        alerts.push(StallAlert {
                            level,
                            worker_id: snap.id,
                            worker_name: snap.name.clone(),
                            state: snap.state,
                            duration_ms: duration,
                        });
                    }
                }
                (false, Some(start)) => {
                    let duration = now_ms.saturating_sub(start);
                    self.total_blocking_time_ms
                        .fetch_add(duration, Ordering::AcqRel);
                    sample.blocking_start_ms = None;
                    sample.warning_logged = false;
                    sample.critical_logged = false;
                    sample.last_trace.clear();
                }
                (false, None) => {}
            }
            sample.state = snap.state;
        }

        self.workers.retain(|id, _| seen.contains(id));
        alerts
    }

    fn log_alert(&self, level: AlertLevel, sample: &WorkerSample, state: WaitState, duration_ms: u64) {
        let trace = if self.config.stack_trace_on_warning {
            format_trace(&sample.last_trace)
        } else {
            String::new()
        };
        match level {
            AlertLevel::Critical => error!(
                worker = %sample.name,
                worker_id = sample.id,
                state = ?state,
                duration_ms,
                threshold_ms = self.config.critical_threshold_ms,
                trace = %trace,
                "runtime worker blocked past critical threshold"
            ),
            AlertLevel::Warning => warn!(
                worker = %sample.name,
                worker_id = sample.id,
                state = ?state,
                duration_ms,
                threshold_ms = self.config.warning_threshold_ms,
                trace = %trace,
                "runtime worker blocked"
            ),
        }
    }

    pub fn stats(&self) -> StallStats {
        let events = self.total_blocking_events.load(Ordering::Acquire);
        let time = self.total_blocking_time_ms.load(Ordering::Acquire);
        let currently_blocked = self
            .workers
            .iter()
            .filter(|w| w.blocking_start_ms.is_some())
            .count();
        StallStats {
            uptime_ms: self
                .clock
                .now_ms()
                .saturating_sub(self.started_ms.load(Ordering::Acquire)),
            total_blocking_events: events,
            total_blocking_time_ms: time,
            monitored_workers: self.workers.len(),
            currently_blocked,
            avg_blocking_time_per_event: if events == 0 { 0 } else { time / events },
        }
    }

    pub fn status(&self) -> MonitorStatus {
        MonitorStatus::from_stats(&self.stats())
    }

    /// Every sampled thread, protected workers first.
    pub fn workers(&self) -> Result<Vec<WorkerInfo>> {
        let mut out: Vec<WorkerInfo> = self
            .sampler
            .sample(false)?
            .into_iter()
            .map(|s| WorkerInfo {
                is_monitored: self.patterns.matches(&s.name),
                id: s.id,
                name: s.name,
                state: s.state,
            })
            .collect();
        out.sort_by(|a, b| b.is_monitored.cmp(&a.is_monitored).then(a.name.cmp(&b.name)));
        Ok(out)
    }

    pub fn monitored_workers(&self) -> Result<Vec<WorkerInfo>> {
        Ok(self.workers()?.into_iter().filter(|w| w.is_monitored).collect())
    }

    pub fn tracked(&self, id: u64) -> Option<WorkerSample> {
        self.workers.get(&id).map(|w| w.clone())
    }
}

fn format_trace(lines: &[String]) -> String {
    let mut out = lines
        .iter()
        .take(MAX_TRACE_LINES)
        .map(|l| format!("\n    at {l}"))
        .collect::<String>();
    if lines.len() > MAX_TRACE_LINES {
        out.push_str(&format!("\n    ... {} more", lines.len() - MAX_TRACE_LINES));
    }
    out
}
