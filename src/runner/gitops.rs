//! Commit and push phase
//!
//! Commit message convention is fixed: `feat(<spec>): <title> [Task <id>]`.
//! Pushes retry on transient failures; permission and non-fast-forward
//! rejections fail the task immediately.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::{message_looks_transient, NecroError, Result};
use crate::workspace::git::Git;

use super::guard::WorkspaceGuard;

const PUSH_ATTEMPTS: u32 = 3;
const PUSH_RETRY_DELAY: Duration = Duration::from_secs(2);

/// `feat(<spec>): <title> [Task <task_id>]`
pub fn commit_message(spec: &str, title: &str, task_id: &str) -> String {
    format!("feat({spec}): {title} [Task {task_id}]")
}

/// Stage everything and commit. Returns the commit hash, or None when the
/// workspace has no changes to commit.
pub async fn commit_all(git: &Git, message: &str) -> Result<Option<String>> {
    git.add_all().await?;
    if git.is_clean().await? {
        warn!("nothing to commit");
        return Ok(None);
    }
    let commit = git.commit(message).await?;
    info!(commit = %commit, "changes committed");
    Ok(Some(commit))
}

/// Push the feature branch with bounded retry on transient failures.
pub async fn push_branch(git: &Git, guard: &WorkspaceGuard, branch: &str) -> Result<()> {
    guard.check_push_branch(branch)?;

    let mut last = String::new();
    for attempt in 1..=PUSH_ATTEMPTS {
        match git.push(branch).await {
            Ok(()) => {
                info!(branch, attempt, "branch pushed");
                return Ok(());
            }
            Err(e) => {
                let reason = e.to_string();
                if is_permanent_push_failure(&reason) {
                    return Err(NecroError::PushRejected {
                        branch: branch.to_string(),
                        reason,
                    });
                }
                warn!(branch, attempt, reason = %reason, "push failed, retrying");
                last = reason;
                if attempt < PUSH_ATTEMPTS {
                    tokio::time::sleep(PUSH_RETRY_DELAY).await;
                }
            }
        }
    }

    Err(NecroError::PushRejected {
        branch: branch.to_string(),
        reason: format!("transient failures exhausted: {last}"),
    })
}

fn is_permanent_push_failure(reason: &str) -> bool {
    let lower = reason.to_lowercase();
    lower.contains("non-fast-forward")
        || lower.contains("permission denied")
        || lower.contains("authentication failed")
        || lower.contains("protected branch")
        || (!message_looks_transient(&lower) && lower.contains("rejected"))
}
