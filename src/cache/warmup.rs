// Cache warmup
//
// Loads a list of ids into the cache with a fixed number of fetches in
// flight, reporting progress at every 10% step. Per-item failures count as
// not found and never abort the batch.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::Context;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::product::ProductCache;

const LOGGED_FAILURES: u64 = 5;
const LOGGED_INVALID_LINES: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WarmupStats {
    pub total_requested: u64,
    pub loaded: u64,
    pub not_found: u64,
    pub duration_ms: u64,
}

/// Live view of a warmup run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WarmupProgress {
    pub pending: bool,
    pub in_progress: bool,
    pub complete: bool,
    pub total_requested: u64,
    pub loaded: u64,
    pub not_found: u64,
    pub percent_complete: u64,
    pub duration_ms: Option<u64>,
}

const PHASE_IDLE: u8 = 0;
const PHASE_PENDING: u8 = 1;
const PHASE_RUNNING: u8 = 2;
const PHASE_DONE: u8 = 3;

/// Shared warmup state, written by the warmup task and read by probes.
#[derive(Debug, Default)]
pub struct WarmupTracker {
    phase: AtomicU8,
    total: AtomicU64,
    loaded: AtomicU64,
    not_found: AtomicU64,
    result: RwLock<Option<WarmupStats>>,
}

impl WarmupTracker {
    /// Announce that a warmup will run, so readiness waits for it.
    pub fn mark_pending(&self) {
        let _ = self
            .phase
            .compare_exchange(PHASE_IDLE, PHASE_PENDING, Ordering::AcqRel, Ordering::Acquire);
    }

    pub fn is_pending(&self) -> bool {
        self.phase.load(Ordering::Acquire) == PHASE_PENDING
    }

    pub fn in_progress(&self) -> bool {
        self.phase.load(Ordering::Acquire) == PHASE_RUNNING
    }

    /// True when no warmup was scheduled or the scheduled one has finished.
    pub fn is_complete(&self) -> bool {
        matches!(self.phase.load(Ordering::Acquire), PHASE_IDLE | PHASE_DONE)
    }

    pub fn result(&self) -> Option<WarmupStats> {
        *self.result.read()
    }

    pub fn progress(&self) -> WarmupProgress {
        let phase = self.phase.load(Ordering::Acquire);
        let total = self.total.load(Ordering::Acquire);
        let loaded = self.loaded.load(Ordering::Acquire);
        let not_found = self.not_found.load(Ordering::Acquire);
        WarmupProgress {
            pending: phase == PHASE_PENDING,
            in_progress: phase == PHASE_RUNNING,
            complete: matches!(phase, PHASE_IDLE | PHASE_DONE),
            total_requested: total,
            loaded,
            not_found,
            percent_complete: percent(loaded + not_found, total),
            duration_ms: self.result().map(|r| r.duration_ms),
        }
    }

    fn begin(&self, total: u64) {
        self.total.store(total, Ordering::Release);
        self.loaded.store(0, Ordering::Release);
        self.not_found.store(0, Ordering::Release);
        self.phase.store(PHASE_RUNNING, Ordering::Release);
    }

    fn finish(&self, stats: WarmupStats) {
        *self.result.write() = Some(stats);
        self.phase.store(PHASE_DONE, Ordering::Release);
    }
}

fn percent(done: u64, total: u64) -> u64 {
    if total == 0 {
        100
    } else {
        done * 100 / total
    }
}

enum Outcome {
    Loaded,
    NotFound,
    Failed(String),
}

impl ProductCache {
    /// Load `ids` into the cache with at most `concurrency` fetches in flight.
    ///
    /// `on_progress` runs each time completion crosses another 10% step and
    /// once more at the end. Returns only after every fetch has finished.
    pub async fn warmup<F>(&self, ids: Vec<i64>, concurrency: usize, mut on_progress: F) -> WarmupStats
    where
        F: FnMut(&WarmupProgress),
    {
        let started_ms = self.clock.now_ms();
        let total = ids.len() as u64;
        self.warmup.begin(total);
        info!(total, concurrency, "cache warmup started");

        let mut results = stream::iter(ids)
            .map(|id| async move {
                match self.fetch(id).await {
                    Ok(Some(product)) => {
                        self.cache.insert(id, Arc::new(product)).await;
                        (id, Outcome::Loaded)
                    }
                    Ok(None) => (id, Outcome::NotFound),
                    Err(err) => (id, Outcome::Failed(err.to_string())),
                }
            })
            .buffer_unordered(concurrency.max(1));

        let mut failures = 0u64;
        let mut last_step = 0u64;
        while let Some((id, outcome)) = results.next().await {
            match outcome {
                Outcome::Loaded => {
                    self.warmup.loaded.fetch_add(1, Ordering::AcqRel);
                }
                Outcome::NotFound => {
                    self.warmup.not_found.fetch_add(1, Ordering::AcqRel);
                }
                Outcome::Failed(reason) => {
                    failures += 1;
                    if failures <= LOGGED_FAILURES {
                        warn!(id, error = %reason, "warmup fetch failed");
                    }
                    self.warmup.not_found.fetch_add(1, Ordering::AcqRel);
                }
            }
            let progress = self.warmup.progress();
            let step = progress.percent_complete / 10;
            if step > last_step {
                last_step = step;
                info!(
                    percent = progress.percent_complete,
                    loaded = progress.loaded,
                    not_found = progress.not_found,
                    total,
                    "cache warmup progress"
                );
                on_progress(&progress);
            }
        }
        if failures > LOGGED_FAILURES {
            warn!(failures, "warmup fetch failures (only the first {LOGGED_FAILURES} were logged)");
        }

        let stats = WarmupStats {
            total_requested: total,
            loaded: self.warmup.loaded.load(Ordering::Acquire),
            not_found: self.warmup.not_found.load(Ordering::Acquire),
            duration_ms: self.clock.now_ms().saturating_sub(started_ms),
        };
        self.warmup.finish(stats);
        on_progress(&self.warmup.progress());
        info!(
            loaded = stats.loaded,
            not_found = stats.not_found,
            duration_ms = stats.duration_ms,
            "cache warmup complete"
        );
        stats
    }

    /// Read the id file on the dispatcher, then warm up from it.
    pub async fn warmup_from_file<F>(
        &self,
        path: &Path,
        limit: u64,
        concurrency: usize,
        on_progress: F,
    ) -> anyhow::Result<WarmupStats>
    where
        F: FnMut(&WarmupProgress),
    {
        let owned = path.to_path_buf();
        let ids = match self
            .dispatcher
            .run(move || read_product_ids(&owned, limit))
            .await
        {
            Ok(ids) => ids,
            Err(err) => {
                // readiness must not wait on a run that will never start
                self.warmup.finish(WarmupStats {
                    total_requested: 0,
                    loaded: 0,
                    not_found: 0,
                    duration_ms: 0,
                });
                return Err(err).context("read warmup id file");
            }
        };
        Ok(self.warmup(ids, concurrency, on_progress).await)
    }
}

/// Read up to `limit` ids, one per line. Blocking.
///
/// Blank lines are skipped and unparsable lines are counted. A missing file
/// yields an empty list.
pub fn read_product_ids(path: &Path, limit: u64) -> Vec<i64> {
    if !path.is_file() {
        warn!(path = %path.display(), "warmup id file not found or not a regular file");
        return Vec::new();
    }
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot open warmup id file");
            return Vec::new();
        }
    };

    let mut ids = Vec::new();
    let mut invalid = 0u64;
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        if ids.len() as u64 >= limit {
            info!(limit, "warmup id limit reached");
            break;
        }
        let line = match line {
            Ok(l) => l,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "stopped reading warmup id file");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match trimmed.parse::<i64>() {
            Ok(id) => ids.push(id),
            Err(_) => {
                invalid += 1;
                if invalid <= LOGGED_INVALID_LINES {
                    warn!(line = lineno + 1, value = trimmed, "invalid product id in warmup file");
                }
            }
        }
    }
    if invalid > 0 {
        warn!(invalid, "skipped invalid lines in warmup id file");
    }
    info!(path = %path.display(), ids = ids.len(), "warmup ids loaded");
    ids
}
