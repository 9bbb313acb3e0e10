//! Runner heartbeat monitor
//!
//! Tracks `runner_id -> last_heartbeat`. Each tick collects runners whose
//! heartbeat age exceeds the timeout and removes them; the dispatcher routes
//! them through the shared failure path. Handler errors are the caller's to
//! swallow and log; the monitor itself never fails a tick.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// What the monitor knows about one in-flight runner
#[derive(Debug, Clone)]
pub struct MonitoredRunner {
    pub runner_id: String,
    pub spec: String,
    pub task_id: String,
    pub last_heartbeat: Instant,
}

/// Heartbeat table with timeout detection
#[derive(Debug)]
pub struct RunnerMonitor {
    entries: DashMap<String, MonitoredRunner>,
    timeout: Duration,
}

impl RunnerMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            timeout,
        }
    }

    pub fn register(&self, runner_id: &str, spec: &str, task_id: &str) {
        self.entries.insert(
            runner_id.to_string(),
            MonitoredRunner {
                runner_id: runner_id.to_string(),
                spec: spec.to_string(),
                task_id: task_id.to_string(),
                last_heartbeat: Instant::now(),
            },
        );
    }

    /// Refresh liveness. Unknown runners are ignored (already timed out or
    /// completed).
    pub fn heartbeat(&self, runner_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(runner_id) {
            entry.last_heartbeat = Instant::now();
        }
    }

    pub fn remove(&self, runner_id: &str) -> Option<MonitoredRunner> {
        self.entries.remove(runner_id).map(|(_, v)| v)
    }

    pub fn contains(&self, runner_id: &str) -> bool {
        self.entries.contains_key(runner_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Collect and remove every runner whose heartbeat age exceeds the
    /// timeout.
    pub fn tick(&self) -> Vec<MonitoredRunner> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| now.duration_since(entry.last_heartbeat) > self.timeout)
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|(_, v)| v))
            .collect()
    }
}
