//! Task model: hierarchical task ids, the task state machine, tasksets,
//! and artifact references.
//!
//! Task ids are opaque dotted strings (`1`, `1.1`, `2.3`) with a total order
//! given by component-wise integer comparison. Parent/child carries no
//! semantics; parent-child relationships are ordinary dependencies.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hierarchical dotted task id (e.g. `1`, `1.1`, `2.3`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Dotted segments; numeric segments compare numerically, non-numeric
    /// segments sort after numeric ones and compare lexicographically.
    fn segments(&self) -> impl Iterator<Item = Segment<'_>> {
        self.0.split('.').map(|s| match s.parse::<u64>() {
            Ok(n) => Segment::Num(n),
            Err(_) => Segment::Text(s),
        })
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum Segment<'a> {
    Num(u64),
    Text(&'a str),
}

impl Ord for TaskId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.segments().cmp(other.segments())
    }
}

impl PartialOrd for TaskId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Ready,
    Blocked,
    Running,
    Done,
    Failed,
}

impl TaskState {
    /// Valid transitions of the task state machine. Everything else is an
    /// InvalidTransition.
    ///
    /// ```text
    /// READY   -> RUNNING | BLOCKED
    /// BLOCKED -> READY
    /// RUNNING -> DONE | FAILED | READY     (last = reset for retry)
    /// FAILED  -> READY | RUNNING           (retry pickup)
    /// DONE    -> READY                     (operator re-run)
    /// ```
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Ready, Running)
                | (Ready, Blocked)
                | (Blocked, Ready)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Ready)
                | (Failed, Ready)
                | (Failed, Running)
                | (Done, Ready)
        )
    }

    /// Terminal for scheduling purposes: DONE and FAILED tasks take no part
    /// in deadlock detection.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Ready => "READY",
            TaskState::Blocked => "BLOCKED",
            TaskState::Running => "RUNNING",
            TaskState::Done => "DONE",
            TaskState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Assignment metadata, present exactly while a task is RUNNING
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub runner_id: String,
    pub slot_id: String,
    pub pool_name: String,
    pub branch_name: String,
}

/// Artifact kinds a task can own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactKind {
    Diff,
    Log,
    TestResult,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArtifactKind::Diff => "DIFF",
            ArtifactKind::Log => "LOG",
            ArtifactKind::TestResult => "TEST_RESULT",
        };
        f.write_str(s)
    }
}

/// A reference to uploaded task output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub uri: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A single unit of work inside a spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    pub required_skill: String,
    #[serde(default)]
    pub priority: i32,
    pub state: TaskState,
    #[serde(default)]
    pub assignment: Option<Assignment>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a task from its definition; initial state is READY when it has
    /// no dependencies, BLOCKED otherwise.
    pub fn from_definition(def: TaskDefinition, now: DateTime<Utc>) -> Self {
        let state = if def.dependencies.is_empty() {
            TaskState::Ready
        } else {
            TaskState::Blocked
        };
        Self {
            id: def.id,
            title: def.title,
            description: def.description,
            acceptance_criteria: def.acceptance_criteria,
            dependencies: def.dependencies,
            required_skill: def.required_skill,
            priority: def.priority,
            state,
            assignment: None,
            artifacts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Input shape for `create_taskset` and tasks.md sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default = "default_skill")]
    pub required_skill: String,
    #[serde(default)]
    pub priority: i32,
}

fn default_skill() -> String {
    "default".to_string()
}

impl TaskDefinition {
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            dependencies: BTreeSet::new(),
            required_skill: default_skill(),
            priority: 0,
        }
    }

    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_skill(mut self, skill: impl Into<String>) -> Self {
        self.required_skill = skill.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_acceptance_criteria<I, S>(mut self, criteria: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acceptance_criteria = criteria.into_iter().map(Into::into).collect();
        self
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

/// The persisted collection of tasks for one spec. `version` increases by one
/// on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taskset {
    pub spec_name: String,
    pub version: u64,
    pub tasks: Vec<Task>,
}

impl Taskset {
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }

    /// READY tasks, optionally filtered by skill, ordered by dependency count
    /// ascending then priority descending.
    pub fn ready_tasks(&self, skill: Option<&str>) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Ready)
            .filter(|t| skill.is_none_or(|s| t.required_skill == s))
            .collect();
        ready.sort_by(|a, b| {
            a.dependencies
                .len()
                .cmp(&b.dependencies.len())
                .then(b.priority.cmp(&a.priority))
                .then(a.id.cmp(&b.id))
        });
        ready
    }

    /// True when every task has reached DONE.
    pub fn all_done(&self) -> bool {
        self.tasks.iter().all(|t| t.state == TaskState::Done)
    }
}
