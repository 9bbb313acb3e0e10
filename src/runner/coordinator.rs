//! In-process runner coordinator
//!
//! When multiple runner instances share one process, each registers the
//! resources it owns (workspace path, branch name). Conflicting
//! registrations are rejected; entries without a recent heartbeat are reaped
//! so a wedged runner cannot pin its resources forever. The per-slot file
//! lock remains the ground truth for slot exclusivity.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::{NecroError, Result};

#[derive(Debug, Clone)]
struct Registration {
    workspace: PathBuf,
    branch: String,
    last_heartbeat: DateTime<Utc>,
}

/// Registry of live runners and the resources they own
#[derive(Debug, Default)]
pub struct RunnerCoordinator {
    registrations: DashMap<String, Registration>,
}

impl RunnerCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner's resources. Fails when another live runner already
    /// owns the workspace or the branch.
    pub fn register(&self, runner_id: &str, workspace: PathBuf, branch: &str) -> Result<()> {
        for entry in self.registrations.iter() {
            if entry.key() == runner_id {
                continue;
            }
            if entry.value().workspace == workspace {
                return Err(NecroError::ResourceConflict {
                    resource: format!("workspace {}", workspace.display()),
                    owner: entry.key().clone(),
                });
            }
            if entry.value().branch == branch {
                return Err(NecroError::ResourceConflict {
                    resource: format!("branch {branch}"),
                    owner: entry.key().clone(),
                });
            }
        }

        self.registrations.insert(
            runner_id.to_string(),
            Registration {
                workspace,
                branch: branch.to_string(),
                last_heartbeat: Utc::now(),
            },
        );
        Ok(())
    }

    /// Refresh a runner's liveness.
    pub fn heartbeat(&self, runner_id: &str) {
        if let Some(mut entry) = self.registrations.get_mut(runner_id) {
            entry.last_heartbeat = Utc::now();
        }
    }

    pub fn deregister(&self, runner_id: &str) {
        self.registrations.remove(runner_id);
    }

    pub fn is_registered(&self, runner_id: &str) -> bool {
        self.registrations.contains_key(runner_id)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Drop entries whose heartbeat is older than `stale_after`. Returns the
    /// reaped runner ids.
    pub fn reap_stale(&self, stale_after: Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::seconds(60));
        let stale: Vec<String> = self
            .registrations
            .iter()
            .filter(|entry| entry.value().last_heartbeat < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &stale {
            self.registrations.remove(id);
            tracing::warn!(runner_id = %id, "reaped stale coordinator entry");
        }
        stale
    }
}
