//! Task event journal
//!
//! Append-only JSONL, one file per spec, ordered by append sequence. Journal
//! writes never take the registry write lock: single-line appends through an
//! O_APPEND handle are atomic enough for one-process writers, and failures
//! reroute to a per-spec fallback journal instead of failing the originating
//! state transition.
//!
//! Layout:
//! - `<registry>/events/<spec>/events.jsonl` — primary journal
//! - `<registry>/fallback/<spec>.jsonl` — used when the primary is unwritable

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{NecroError, Result};
use crate::registry::task::TaskId;

/// Event kinds in the per-spec journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    TaskCreated,
    TaskReady,
    TaskAssigned,
    RunnerStarted,
    RunnerFinished,
    TaskCompleted,
    TaskFailed,
    TaskUpdated,
    /// Operator-only DONE -> READY rewind
    TaskReopened,
}

/// One immutable journal record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl TaskEvent {
    pub fn new(task_id: &TaskId, event_type: EventType) -> Self {
        Self {
            timestamp: Utc::now(),
            task_id: task_id.as_str().to_string(),
            event_type,
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// TaskAssigned with the §6 detail keys
    pub fn assigned(task_id: &TaskId, runner_id: &str, slot_id: &str, pool_name: &str) -> Self {
        Self::new(task_id, EventType::TaskAssigned)
            .with_detail("runner_id", runner_id)
            .with_detail("slot_id", slot_id)
            .with_detail("pool_name", pool_name)
    }

    /// RunnerFinished with success flag and timing
    pub fn runner_finished(
        task_id: &TaskId,
        success: bool,
        execution_time_seconds: f64,
        failure_reason: Option<&str>,
    ) -> Self {
        let mut event = Self::new(task_id, EventType::RunnerFinished)
            .with_detail("success", success)
            .with_detail("execution_time_seconds", execution_time_seconds);
        if let Some(reason) = failure_reason {
            event = event.with_detail("failure_reason", reason);
        }
        event
    }
}

/// Per-spec JSONL journal with crash-safe fallback
#[derive(Debug)]
pub struct EventJournal {
    base_path: PathBuf,
    fallback_writes: AtomicU64,
}

impl EventJournal {
    pub fn new(registry_base: &Path) -> Self {
        Self {
            base_path: registry_base.to_path_buf(),
            fallback_writes: AtomicU64::new(0),
        }
    }

    pub fn journal_path(&self, spec: &str) -> PathBuf {
        self.base_path.join("events").join(spec).join("events.jsonl")
    }

    pub fn fallback_path(&self, spec: &str) -> PathBuf {
        self.base_path.join("fallback").join(format!("{spec}.jsonl"))
    }

    /// Number of events that had to go through the fallback journal.
    pub fn fallback_count(&self) -> u64 {
        self.fallback_writes.load(Ordering::Relaxed)
    }

    /// Append an event. Primary journal first; on failure the event goes to
    /// the fallback journal and the append still succeeds. Only a double
    /// failure surfaces an error.
    pub fn append(&self, spec: &str, event: &TaskEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;

        match Self::append_line(&self.journal_path(spec), &line) {
            Ok(()) => Ok(()),
            Err(primary) => {
                warn!(
                    spec,
                    error = %primary,
                    "event journal unwritable, using fallback"
                );
                self.fallback_writes.fetch_add(1, Ordering::Relaxed);
                Self::append_line(&self.fallback_path(spec), &line).map_err(|e| {
                    NecroError::FallbackJournalWrite {
                        spec: spec.to_string(),
                        reason: e.to_string(),
                    }
                })
            }
        }
    }

    fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Read every event for a spec in append order. Used by tests and event
    /// consumers reconciling the stream.
    pub fn read_all(&self, spec: &str) -> Result<Vec<TaskEvent>> {
        let path = self.journal_path(spec);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }
}
