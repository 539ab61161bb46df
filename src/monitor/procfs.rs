// Linux thread sampler backed by /proc/self/task
//
// The kernel reports whether a thread is running or sleeping, but a tokio
// worker also sleeps when it has nothing to do. `ParkRegistry` is fed by the
// runtime's park/unpark hooks; a worker that is parked is idle, and a worker
// that is unparked yet sleeping in the kernel is stuck in a blocking call.
// Runtime threads that never park (the blocking pool shares the workers'
// name) are allowed to block and always read as runnable.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::runtime::Builder;

use crate::monitor::sampler::{WaitState, WorkerSampler, WorkerSnapshot};

thread_local! {
    static OS_TID: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Kernel thread id of the calling thread.
pub fn current_tid() -> Option<u64> {
    OS_TID.with(|cached| {
        if let Some(tid) = cached.get() {
            return Some(tid);
        }
        let tid = fs::read_link("/proc/thread-self")
            .ok()
            .and_then(|p| p.file_name()?.to_str()?.parse::<u64>().ok());
        cached.set(tid);
        tid
    })
}

/// What the runtime last reported about one of its threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkState {
    /// Started by the runtime but never parked: a blocking-pool thread, or a
    /// worker that has not gone idle yet.
    Started,
    Parked,
    Unparked,
}

/// Park state of runtime threads keyed by kernel thread id.
#[derive(Debug, Default)]
pub struct ParkRegistry {
    threads: DashMap<u64, ParkState>,
}

impl ParkRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wire the registry into a runtime builder's thread hooks.
    pub fn install<'a>(self: &Arc<Self>, builder: &'a mut Builder) -> &'a mut Builder {
        let on_start = Arc::clone(self);
        let on_park = Arc::clone(self);
        let on_unpark = Arc::clone(self);
        let on_stop = Arc::clone(self);
        builder
            .on_thread_start(move || {
                if let Some(tid) = current_tid() {
                    on_start.register(tid);
                }
            })
            .on_thread_park(move || {
                if let Some(tid) = current_tid() {
                    on_park.mark(tid, true);
                }
            })
            .on_thread_unpark(move || {
                if let Some(tid) = current_tid() {
                    on_unpark.mark(tid, false);
                }
            })
            .on_thread_stop(move || {
                if let Some(tid) = current_tid() {
                    on_stop.forget(tid);
                }
            })
    }

    /// Record a runtime thread; an existing park state is kept.
    pub fn register(&self, tid: u64) {
        self.threads.entry(tid).or_insert(ParkState::Started);
    }

    pub fn mark(&self, tid: u64, parked: bool) {
        let state = if parked {
            ParkState::Parked
        } else {
            ParkState::Unparked
        };
        self.threads.insert(tid, state);
    }

    pub fn forget(&self, tid: u64) {
        self.threads.remove(&tid);
    }

    /// `None` for threads the runtime does not own.
    pub fn state(&self, tid: u64) -> Option<ParkState> {
        self.threads.get(&tid).map(|v| *v)
    }
}

pub struct ProcfsSampler {
    task_dir: PathBuf,
    registry: Arc<ParkRegistry>,
}

impl ProcfsSampler {
    pub fn new(registry: Arc<ParkRegistry>) -> Self {
        Self {
            task_dir: PathBuf::from("/proc/self/task"),
            registry,
        }
    }

    pub fn with_task_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.task_dir = dir.into();
        self
    }

    fn read_thread(&self, tid: u64, dir: &Path, with_trace: bool) -> Option<WorkerSnapshot> {
        // threads can exit between listing and reading; skip them
        let stat = fs::read_to_string(dir.join("stat")).ok()?;
        let letter = state_letter(&stat)?;
        if matches!(letter, 'Z' | 'X' | 'x') {
            return None;
        }
        let name = fs::read_to_string(dir.join("comm"))
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default();
        let wchan = read_trimmed(&dir.join("wchan"));
        let state = classify(letter, wchan.as_deref(), self.registry.state(tid));

        let mut snapshot = WorkerSnapshot::new(tid, name, state);
        if with_trace {
            let mut trace = Vec::new();
            if let Some(w) = wchan.filter(|w| w != "0") {
                trace.push(format!("wchan: {w}"));
            }
            if let Some(s) = read_trimmed(&dir.join("syscall")) {
                trace.push(format!("syscall: {s}"));
            }
            trace.push(format!("kernel state: {letter}"));
            snapshot = snapshot.with_trace(trace);
        }
        Some(snapshot)
    }
}

impl WorkerSampler for ProcfsSampler {
    fn sample(&self, with_trace: bool) -> Result<Vec<WorkerSnapshot>> {
        let entries = fs::read_dir(&self.task_dir)
            .with_context(|| format!("list threads in {}", self.task_dir.display()))?;
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            if let Some(snapshot) = self.read_thread(tid, &entry.path(), with_trace) {
                out.push(snapshot);
            }
        }
        out.sort_by_key(|s| s.id);
        Ok(out)
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// State letter from a `stat` line; the command name may contain spaces or
/// parentheses, so scan from the last ')'.
fn state_letter(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.trim_start().chars().next()
}

/// Foreign threads (`None`) are classified by kernel state alone.
fn classify(letter: char, wchan: Option<&str>, park: Option<ParkState>) -> WaitState {
    if matches!(park, Some(ParkState::Parked | ParkState::Started)) {
        return WaitState::Runnable;
    }
    match letter {
        'D' => WaitState::Blocked,
        'S' if wchan.is_some_and(|w| w.contains("nanosleep")) => WaitState::TimedWaiting,
        'S' | 'T' | 't' => WaitState::Waiting,
        _ => WaitState::Runnable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_thread(root: &Path, tid: u64, comm: &str, state: char, wchan: &str) {
        let dir = root.join(tid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
        fs::write(
            dir.join("stat"),
            format!("{tid} ({comm}) {state} 1 1 1 0 -1 4194560 0 0 0 0\n"),
        )
        .unwrap();
        fs::write(dir.join("wchan"), wchan).unwrap();
        fs::write(dir.join("syscall"), "202 0x7f 0x80 0x0\n").unwrap();
    }

    #[test]
    fn state_letter_survives_odd_names() {
        assert_eq!(state_letter("12 (a) b) S 1 2"), Some('S'));
        assert_eq!(state_letter("12 (lookup worker) R 1"), Some('R'));
        assert_eq!(state_letter("garbage"), None);
    }

    #[test]
    fn classification_uses_park_state() {
        let parked = Some(ParkState::Parked);
        let running = Some(ParkState::Unparked);
        assert_eq!(classify('S', Some("futex_wait_queue"), parked), WaitState::Runnable);
        assert_eq!(classify('S', Some("futex_wait_queue"), running), WaitState::Waiting);
        assert_eq!(classify('S', Some("hrtimer_nanosleep"), running), WaitState::TimedWaiting);
        assert_eq!(classify('D', None, running), WaitState::Blocked);
        assert_eq!(classify('R', None, running), WaitState::Runnable);
        assert_eq!(classify('S', None, None), WaitState::Waiting);
        // runtime threads that never parked are blocking-pool threads
        assert_eq!(classify('S', Some("futex_wait_queue"), Some(ParkState::Started)), WaitState::Runnable);
        assert_eq!(classify('D', None, Some(ParkState::Started)), WaitState::Runnable);
    }

    #[test]
    fn samples_fake_task_directory() {
        let root = tempfile::tempdir().unwrap();
        fake_thread(root.path(), 11, "lookup-worker", 'S', "do_nanosleep");
        fake_thread(root.path(), 12, "lookup-worker", 'S', "ep_poll");
        fake_thread(root.path(), 13, "db-dispatcher-1", 'D', "io_schedule");
        fake_thread(root.path(), 14, "gone", 'Z', "0");
        fs::create_dir_all(root.path().join("not-a-tid")).unwrap();

        let registry = ParkRegistry::new();
        registry.mark(11, false);
        registry.mark(12, true);
        let sampler = ProcfsSampler::new(registry).with_task_dir(root.path());

        let threads = sampler.sample(true).unwrap();
        let ids: Vec<u64> = threads.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![11, 12, 13]);
        assert_eq!(threads[0].state, WaitState::TimedWaiting);
        assert_eq!(threads[0].name, "lookup-worker");
        assert!(threads[0].trace.iter().any(|l| l == "wchan: do_nanosleep"));
        assert_eq!(threads[1].state, WaitState::Runnable);
        assert_eq!(threads[2].state, WaitState::Blocked);

        let bare = sampler.sample(false).unwrap();
        assert!(bare.iter().all(|t| t.trace.is_empty()));
    }

    #[test]
    fn idle_blocking_pool_thread_is_not_stalled() {
        let root = tempfile::tempdir().unwrap();
        // worker and blocking-pool thread share the runtime's thread name
        fake_thread(root.path(), 21, "lookup-worker", 'S', "futex_wait_queue");
        fake_thread(root.path(), 22, "lookup-worker", 'S', "futex_wait_queue");
        let registry = ParkRegistry::new();
        registry.register(21);
        registry.mark(21, true);
        registry.register(22);
        // a later start hook must not erase the park state
        registry.register(21);
        assert_eq!(registry.state(21), Some(ParkState::Parked));

        let sampler = ProcfsSampler::new(registry).with_task_dir(root.path());
        let threads = sampler.sample(false).unwrap();
        assert!(threads.iter().all(|t| t.state == WaitState::Runnable));
    }

    #[test]
    fn missing_task_dir_is_an_error() {
        let sampler = ProcfsSampler::new(ParkRegistry::new()).with_task_dir("/nonexistent/task");
        assert!(sampler.sample(false).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn current_thread_is_listed_by_real_procfs() {
        let tid = current_tid().expect("tid");
        let sampler = ProcfsSampler::new(ParkRegistry::new());
        let threads = sampler.sample(false).unwrap();
        assert!(threads.iter().any(|t| t.id == tid));
    }
}
