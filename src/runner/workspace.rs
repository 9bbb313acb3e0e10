//! Runner workspace phase: feature branch preparation, prompt assembly, and
//! application of generated changes.

use std::path::Path;

use tracing::{debug, info};

use crate::error::{NecroError, Result};
use crate::workspace::git::Git;

use super::codegen::{FileOperation, GeneratedChanges};
use super::context::RunnerContext;
use super::guard::WorkspaceGuard;

/// Cap on the workspace listing embedded in prompts.
const PROMPT_FILE_LIMIT: usize = 200;

/// `feature/task-<spec>-<task_id>-<short-desc>` with a slugged title.
pub fn feature_branch_name(spec: &str, task_id: &str, title: &str) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(4)
        .collect::<Vec<_>>()
        .join("-");
    let task_slug = task_id.replace('.', "-");
    if slug.is_empty() {
        format!("feature/task-{spec}-{task_slug}")
    } else {
        format!("feature/task-{spec}-{task_slug}-{slug}")
    }
}

/// Create and check out the task branch. The shared object store makes every
/// slot's branches visible, so an existing branch means another slot already
/// owns this task's name.
pub async fn prepare_branch(git: &Git, ctx: &RunnerContext) -> Result<()> {
    if git.branch_exists(&ctx.branch_name).await? {
        return Err(NecroError::BranchInUse {
            branch: ctx.branch_name.clone(),
            owner: "another worktree".to_string(),
        });
    }
    git.checkout_new_branch(&ctx.branch_name).await?;
    info!(branch = %ctx.branch_name, "feature branch prepared");
    Ok(())
}

/// Gitignore-aware listing of workspace files, relative paths sorted, capped
/// at the prompt limit.
pub fn list_workspace_files(slot_path: &Path) -> Vec<String> {
    let mut files: Vec<String> = ignore::WalkBuilder::new(slot_path)
        .hidden(true)
        .git_ignore(true)
        .require_git(false)
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(slot_path)
                .ok()
                .map(|p| p.to_string_lossy().into_owned())
        })
        .collect();
    files.sort();
    files.truncate(PROMPT_FILE_LIMIT);
    files
}

/// Assemble the generation prompt from the task description and the current
/// workspace shape.
pub fn build_prompt(ctx: &RunnerContext, files: &[String]) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("Task {} — {}\n\n", ctx.task_id, ctx.title));
    prompt.push_str(&ctx.description);
    prompt.push_str("\n\n");

    if !ctx.acceptance_criteria.is_empty() {
        prompt.push_str("Acceptance criteria:\n");
        for (i, criterion) in ctx.acceptance_criteria.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, criterion));
        }
        prompt.push('\n');
    }

    prompt.push_str("Workspace files:\n");
    for file in files {
        prompt.push_str(&format!("- {file}\n"));
    }
    prompt.push_str(
        "\nRespond with JSON: {\"changes\": [{\"file_path\", \"operation\": \
         create|update|delete, \"content\"}]}\n",
    );
    prompt
}

/// Apply generated changes inside the guard's boundary. Returns the count of
/// applied changes.
pub fn apply_changes(guard: &WorkspaceGuard, changes: &GeneratedChanges) -> Result<usize> {
    for change in &changes.changes {
        let path = guard.check_path(Path::new(&change.file_path))?;
        match change.operation {
            FileOperation::Create | FileOperation::Update => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, &change.content)?;
                debug!(file = %change.file_path, op = ?change.operation, "change applied");
            }
            FileOperation::Delete => {
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
                debug!(file = %change.file_path, "file deleted");
            }
        }
    }
    Ok(changes.changes.len())
}
