// Worker introspection seam
//
// The stall detector only needs `{id, name, state, trace}` per thread. How a
// runtime produces that is up to the sampler implementation.

use anyhow::Result;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitState {
    Runnable,
    Blocked,
    Waiting,
    TimedWaiting,
}

impl WaitState {
    /// A non-blocking worker in any of these states is stalled.
    pub fn is_blocking(self) -> bool {
        matches!(self, WaitState::Blocked | WaitState::Waiting | WaitState::TimedWaiting)
    }
}

/// One thread as seen by a single sampling pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub id: u64,
    pub name: String,
    pub state: WaitState,
    pub trace: Vec<String>,
}

impl WorkerSnapshot {
    pub fn new(id: u64, name: impl Into<String>, state: WaitState) -> Self {
        Self {
            id,
            name: name.into(),
            state,
            trace: Vec::new(),
        }
    }

    pub fn with_trace(mut self, trace: Vec<String>) -> Self {
        self.trace = trace;
        self
    }
}

pub trait WorkerSampler: Send + Sync + 'static {
    /// Every live thread. `with_trace` asks for trace lines when available.
    fn sample(&self, with_trace: bool) -> Result<Vec<WorkerSnapshot>>;
}

/// Identifies protected workers by case-insensitive name substring.
#[derive(Debug, Clone)]
pub struct NamePatterns {
    patterns: Vec<String>,
}

impl NamePatterns {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.patterns.iter().any(|p| name.contains(p.as_str()))
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_states() {
        assert!(!WaitState::Runnable.is_blocking());
        assert!(WaitState::Blocked.is_blocking());
        assert!(WaitState::Waiting.is_blocking());
        assert!(WaitState::TimedWaiting.is_blocking());
    }

    #[test]
    fn patterns_match_case_insensitive_substrings() {
        let p = NamePatterns::new(["Lookup-Worker", " ", "io-loop"]);
        assert_eq!(p.patterns().len(), 2);
        assert!(p.matches("lookup-worker-3"));
        assert!(p.matches("IO-LOOP"));
        assert!(!p.matches("db-dispatcher-1"));
    }

    #[test]
    fn wait_state_serializes_like_thread_states() {
        let v = serde_json::to_value(WaitState::TimedWaiting).unwrap();
        assert_eq!(v, "TIMED_WAITING");
    }
}
