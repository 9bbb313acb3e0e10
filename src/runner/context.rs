//! Runner execution context
//!
//! The dispatcher hands one of these to every launched runner. Subprocess
//! runners read it as JSON from the file named by `NECROCODE_CONTEXT`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{NecroError, Result};

pub const CONTEXT_ENV_VAR: &str = "NECROCODE_CONTEXT";

/// Everything a runner needs to execute one task in one slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerContext {
    pub runner_id: String,
    pub spec_name: String,
    pub task_id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub required_skill: String,
    pub pool_name: String,
    pub slot_id: String,
    pub slot_path: PathBuf,
    pub branch_name: String,
    pub timeout_secs: u64,
    /// Task-specific test command; falls back to the project default
    #[serde(default)]
    pub test_command: Option<String>,
    /// Registry root so the runner can report completion and artifacts
    pub registry_base: PathBuf,
    pub artifact_store_path: PathBuf,
}

impl RunnerContext {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Fail fast on missing required fields. A missing acceptance-criteria
    /// list is only worth a warning.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        for (field, value) in [
            ("runner_id", &self.runner_id),
            ("spec_name", &self.spec_name),
            ("task_id", &self.task_id),
            ("title", &self.title),
            ("description", &self.description),
            ("required_skill", &self.required_skill),
            ("slot_id", &self.slot_id),
            ("branch_name", &self.branch_name),
        ] {
            if value.trim().is_empty() {
                missing.push(field);
            }
        }
        if !missing.is_empty() {
            return Err(NecroError::ContextInvalid {
                reason: format!("missing fields: {}", missing.join(", ")),
            });
        }
        if !self.slot_path.is_dir() {
            return Err(NecroError::ContextInvalid {
                reason: format!("slot path {} is not a directory", self.slot_path.display()),
            });
        }
        if self.timeout_secs == 0 {
            return Err(NecroError::ContextInvalid {
                reason: "timeout must be positive".to_string(),
            });
        }
        if self.acceptance_criteria.is_empty() {
            warn!(task_id = %self.task_id, "task has no acceptance criteria");
        }
        Ok(())
    }

    /// Load a context from the file named by `NECROCODE_CONTEXT`.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONTEXT_ENV_VAR).map_err(|_| NecroError::ContextInvalid {
            reason: format!("{CONTEXT_ENV_VAR} is not set"),
        })?;
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Persist the context for a subprocess runner; returns the file path.
    pub fn write_to(&self, dir: &std::path::Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", self.runner_id));
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }
}
