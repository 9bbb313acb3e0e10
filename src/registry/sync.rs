//! tasks.md sync collaborator
//!
//! Re-syncs a taskset from a human-readable checklist. Recognized line shape:
//!
//! ```text
//! - [ ] 1 Scaffold the crate
//! - [~] 1.1 Wire the config loader (deps: 1) [skill: backend] [priority: 5]
//! - [x] 2 Ship it (deps: 1, 1.1)
//! ```
//!
//! Checkbox table: `[x]` -> DONE, `[~]` -> RUNNING, `[ ]` -> READY or BLOCKED
//! (recomputed from dependency states). New tasks are added, existing tasks
//! updated in place, removed tasks are reported but never deleted. Sync is
//! idempotent.

use std::collections::BTreeSet;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use crate::error::{NecroError, Result};
use crate::registry::task::{Task, TaskDefinition, TaskId, TaskState, Taskset};
use crate::registry::TaskRegistry;

static TASK_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*-\s*\[(?P<box>[ x~])\]\s+(?P<id>\d+(?:\.\d+)*)\.?\s+(?P<rest>.+)$")
        .expect("task line regex")
});

static DEPS_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(deps:\s*(?P<deps>[^)]*)\)").expect("deps regex"));

static SKILL_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[skill:\s*(?P<skill>[^\]]+)\]").expect("skill regex"));

static PRIORITY_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[priority:\s*(?P<prio>-?\d+)\]").expect("priority regex"));

/// One parsed checklist entry
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTask {
    pub definition: TaskDefinition,
    pub checkbox_state: CheckboxState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckboxState {
    Open,
    InProgress,
    Checked,
}

/// Outcome of one sync pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub added: Vec<TaskId>,
    pub updated: Vec<TaskId>,
    pub unchanged: Vec<TaskId>,
    /// In the registry but missing from the markdown; reported, not deleted.
    pub removed: Vec<TaskId>,
}

/// Parse a tasks.md document into ordered task entries. Lines that do not
/// match the checklist shape are ignored (headings, prose).
pub fn parse_tasks_md(content: &str) -> Result<Vec<ParsedTask>> {
    let mut parsed = Vec::new();
    let mut seen = BTreeSet::new();

    for line in content.lines() {
        let Some(caps) = TASK_LINE.captures(line) else {
            continue;
        };

        let id = TaskId::new(&caps["id"]);
        if !seen.insert(id.clone()) {
            return Err(NecroError::InvalidConfig {
                reason: format!("tasks.md lists task '{id}' twice"),
            });
        }

        let checkbox_state = match &caps["box"] {
            "x" => CheckboxState::Checked,
            "~" => CheckboxState::InProgress,
            _ => CheckboxState::Open,
        };

        let rest = caps["rest"].trim();
        let dependencies: BTreeSet<TaskId> = DEPS_SUFFIX
            .captures(rest)
            .map(|c| {
                c["deps"]
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(TaskId::from)
                    .collect()
            })
            .unwrap_or_default();
        let skill = SKILL_SUFFIX
            .captures(rest)
            .map(|c| c["skill"].trim().to_string());
        let priority = PRIORITY_SUFFIX
            .captures(rest)
            .and_then(|c| c["prio"].parse().ok())
            .unwrap_or(0);

        let title = {
            let mut t = DEPS_SUFFIX.replace(rest, "").to_string();
            t = SKILL_SUFFIX.replace(&t, "").to_string();
            t = PRIORITY_SUFFIX.replace(&t, "").to_string();
            t.trim().to_string()
        };

        let mut definition = TaskDefinition::new(id, title)
            .with_dependencies(dependencies)
            .with_priority(priority);
        if let Some(skill) = skill {
            definition = definition.with_skill(skill);
        }

        parsed.push(ParsedTask {
            definition,
            checkbox_state,
        });
    }

    Ok(parsed)
}

/// Map a checkbox to a task state, recomputing READY/BLOCKED for open boxes
/// from the DONE-ness of dependencies within the synced document.
fn state_for(entry: &ParsedTask, done_ids: &BTreeSet<TaskId>) -> TaskState {
    match entry.checkbox_state {
        CheckboxState::Checked => TaskState::Done,
        CheckboxState::InProgress => TaskState::Running,
        CheckboxState::Open => {
            if entry
                .definition
                .dependencies
                .iter()
                .all(|d| done_ids.contains(d))
            {
                TaskState::Ready
            } else {
                TaskState::Blocked
            }
        }
    }
}

impl TaskRegistry {
    /// Sync a taskset from tasks.md content. Creates the taskset if missing.
    pub fn sync_from_tasks_md(&self, spec: &str, content: &str) -> Result<SyncReport> {
        let parsed = parse_tasks_md(content)?;

        let definitions: Vec<TaskDefinition> =
            parsed.iter().map(|p| p.definition.clone()).collect();
        if let Some(cycle) = super::find_cycle(&definitions) {
            return Err(NecroError::CircularDependency {
                cycle: cycle.into_iter().map(String::from).collect(),
            });
        }

        let done_ids: BTreeSet<TaskId> = parsed
            .iter()
            .filter(|p| p.checkbox_state == CheckboxState::Checked)
            .map(|p| p.definition.id.clone())
            .collect();

        let mut report = SyncReport::default();
        let now = Utc::now();

        let existing = match self.get_taskset(spec) {
            Ok(ts) => Some(ts),
            Err(NecroError::TasksetNotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        let mut taskset = match existing {
            None => {
                let mut ts = self.create_taskset(spec, definitions)?;
                report.added = ts.tasks.iter().map(|t| t.id.clone()).collect();
                // Apply checkbox states on top of the freshly created set.
                for entry in &parsed {
                    let state = state_for(entry, &done_ids);
                    if let Some(task) = ts.task_mut(&entry.definition.id) {
                        task.state = state;
                    }
                }
                ts
            }
            Some(mut ts) => {
                let synced_ids: BTreeSet<TaskId> =
                    parsed.iter().map(|p| p.definition.id.clone()).collect();

                for task in &ts.tasks {
                    if !synced_ids.contains(&task.id) {
                        report.removed.push(task.id.clone());
                    }
                }

                for entry in &parsed {
                    let state = state_for(entry, &done_ids);
                    match ts.task_mut(&entry.definition.id) {
                        Some(task) => {
                            let changed = task.title != entry.definition.title
                                || task.dependencies != entry.definition.dependencies
                                || task.state != state
                                || task.priority != entry.definition.priority;
                            if changed {
                                task.title = entry.definition.title.clone();
                                task.dependencies = entry.definition.dependencies.clone();
                                task.priority = entry.definition.priority;
                                task.state = state;
                                task.updated_at = now;
                                report.updated.push(task.id.clone());
                            } else {
                                report.unchanged.push(task.id.clone());
                            }
                        }
                        None => {
                            let mut task = Task::from_definition(entry.definition.clone(), now);
                            task.state = state;
                            report.added.push(task.id.clone());
                            ts.tasks.push(task);
                        }
                    }
                }
                ts
            }
        };

        self.store_synced(&mut taskset)?;
        info!(
            spec,
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            "tasks.md sync applied"
        );
        Ok(report)
    }

    /// Persist a synced taskset under the spec write lock.
    fn store_synced(&self, taskset: &mut Taskset) -> Result<()> {
        let spec = taskset.spec_name.clone();
        let _lock = self.write_lock(&spec)?;
        self.store(taskset)
    }
}
