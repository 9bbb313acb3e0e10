//! Optional persisted runner state
//!
//! When enabled, every lifecycle transition writes a snapshot to a per-runner
//! state file; the file is deleted on successful completion. Invalid
//! transitions fail the runner.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{NecroError, Result};

/// Runner lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl RunnerState {
    pub fn can_transition_to(self, to: RunnerState) -> bool {
        use RunnerState::*;
        matches!(
            (self, to),
            (Idle, Running) | (Running, Completed) | (Running, Failed) | (Completed, Idle) | (Failed, Idle)
        )
    }
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunnerState::Idle => "IDLE",
            RunnerState::Running => "RUNNING",
            RunnerState::Completed => "COMPLETED",
            RunnerState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Snapshot written on every transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub runner_id: String,
    pub state: RunnerState,
    pub spec_name: String,
    pub task_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Persisted state machine for one runner
#[derive(Debug)]
pub struct RunnerStateFile {
    path: PathBuf,
    runner_id: String,
    spec_name: String,
    task_id: String,
    state: RunnerState,
    enabled: bool,
}

impl RunnerStateFile {
    pub fn new(
        dir: &Path,
        runner_id: &str,
        spec_name: &str,
        task_id: &str,
        enabled: bool,
    ) -> Self {
        Self {
            path: dir.join(format!("{runner_id}.state.json")),
            runner_id: runner_id.to_string(),
            spec_name: spec_name.to_string(),
            task_id: task_id.to_string(),
            state: RunnerState::Idle,
            enabled,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply a transition, persisting the snapshot when enabled.
    pub fn transition(&mut self, to: RunnerState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(NecroError::RunnerStateInvalid {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;

        if self.enabled {
            let snapshot = StateSnapshot {
                runner_id: self.runner_id.clone(),
                state: self.state,
                spec_name: self.spec_name.clone(),
                task_id: self.task_id.clone(),
                updated_at: Utc::now(),
            };
            if let Some(dir) = self.path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(&self.path, serde_json::to_vec_pretty(&snapshot)?)?;
        }
        Ok(())
    }

    /// Remove the state file after a clean COMPLETED -> IDLE cycle.
    pub fn clear(&self) -> Result<()> {
        if self.enabled && self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lifecycle_transitions() {
        use RunnerState::*;
        assert!(Idle.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Idle));
        assert!(Failed.can_transition_to(Idle));

        assert!(!Idle.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn snapshots_written_and_cleared() {
        let dir = tempdir().unwrap();
        let mut state = RunnerStateFile::new(dir.path(), "runner-1", "demo", "1", true);

        state.transition(RunnerState::Running).unwrap();
        assert!(state.path().exists());
        let snapshot: StateSnapshot =
            serde_json::from_str(&std::fs::read_to_string(state.path()).unwrap()).unwrap();
        assert_eq!(snapshot.state, RunnerState::Running);

        state.transition(RunnerState::Completed).unwrap();
        state.transition(RunnerState::Idle).unwrap();
        state.clear().unwrap();
        assert!(!state.path().exists());
    }

    #[test]
    fn invalid_transition_fails_runner() {
        let dir = tempdir().unwrap();
        let mut state = RunnerStateFile::new(dir.path(), "runner-1", "demo", "1", true);
        let err = state.transition(RunnerState::Completed).unwrap_err();
        assert_eq!(err.code(), "NECRO-066");
    }

    #[test]
    fn disabled_persistence_writes_nothing() {
        let dir = tempdir().unwrap();
        let mut state = RunnerStateFile::new(dir.path(), "runner-1", "demo", "1", false);
        state.transition(RunnerState::Running).unwrap();
        assert!(!state.path().exists());
    }
}
