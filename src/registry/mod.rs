//! Task Registry - durable source of truth for task state
//!
//! One directory per registry:
//! - `tasksets/<spec>.json` — the taskset document (atomic tmp+rename writes)
//! - `events/<spec>/events.jsonl` — append-only journal
//! - `locks/<spec>.lock` — per-spec advisory write lock
//! - `fallback/<spec>.jsonl` — journal fallback
//!
//! Writes are serialized per spec by the lockfile; reads are lock-free.

pub mod events;
pub mod sync;
pub mod task;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::error::{NecroError, Result};
use crate::workspace::lock::FileLock;

use events::{EventJournal, EventType, TaskEvent};
use task::{Artifact, Assignment, Task, TaskDefinition, TaskId, TaskState, Taskset};

/// Durable task graph with serialized per-spec writes
#[derive(Debug)]
pub struct TaskRegistry {
    config: RegistryConfig,
    journal: EventJournal,
}

impl TaskRegistry {
    /// Open (creating directories as needed) a registry rooted at the
    /// configured base path.
    pub fn open(config: RegistryConfig) -> Result<Self> {
        for sub in ["tasksets", "events", "locks", "fallback"] {
            std::fs::create_dir_all(config.base_path.join(sub))?;
        }
        let journal = EventJournal::new(&config.base_path);
        Ok(Self { config, journal })
    }

    pub fn base_path(&self) -> &Path {
        &self.config.base_path
    }

    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }

    fn taskset_path(&self, spec: &str) -> PathBuf {
        self.config.base_path.join("tasksets").join(format!("{spec}.json"))
    }

    fn lock_path(&self, spec: &str) -> PathBuf {
        self.config.base_path.join("locks").join(format!("{spec}.lock"))
    }

    /// Acquire the per-spec write lock, mapping lock timeouts to the
    /// registry's transient error category.
    fn write_lock(&self, spec: &str) -> Result<FileLock> {
        let attempts = (self.config.lock_timeout_ms / self.config.lock_retry_interval_ms.max(1))
            .max(1) as u32;
        FileLock::acquire(
            &self.lock_path(spec),
            &format!("registry:{}", std::process::id()),
            self.config.lock_timeout(),
            self.config.lock_retry_interval(),
        )
        .map_err(|e| NecroError::TransientRegistry {
            spec: spec.to_string(),
            attempts,
            reason: e.to_string(),
        })
    }

    fn load(&self, spec: &str) -> Result<Taskset> {
        let path = self.taskset_path(spec);
        if !path.exists() {
            return Err(NecroError::TasksetNotFound {
                spec: spec.to_string(),
            });
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Persist a taskset atomically and bump its version.
    fn store(&self, taskset: &mut Taskset) -> Result<()> {
        taskset.version += 1;
        let path = self.taskset_path(&taskset.spec_name);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(taskset)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Operations
    // ═══════════════════════════════════════════════════════════════

    /// Create a taskset from definitions. Fails if the spec already exists,
    /// a dependency references an unknown task, or the graph has a cycle.
    pub fn create_taskset(&self, spec: &str, definitions: Vec<TaskDefinition>) -> Result<Taskset> {
        let _lock = self.write_lock(spec)?;

        if self.taskset_path(spec).exists() {
            return Err(NecroError::TasksetExists {
                spec: spec.to_string(),
            });
        }

        validate_dependencies(&definitions)?;
        if let Some(cycle) = find_cycle(&definitions) {
            return Err(NecroError::CircularDependency {
                cycle: cycle.into_iter().map(String::from).collect(),
            });
        }

        let now = Utc::now();
        let tasks: Vec<Task> = definitions
            .into_iter()
            .map(|def| Task::from_definition(def, now))
            .collect();

        let mut taskset = Taskset {
            spec_name: spec.to_string(),
            version: 0,
            tasks,
        };
        self.store(&mut taskset)?;

        for t in &taskset.tasks {
            self.journal
                .append(spec, &TaskEvent::new(&t.id, EventType::TaskCreated))?;
        }

        info!(spec, tasks = taskset.tasks.len(), "taskset created");
        Ok(taskset)
    }

    /// Lock-free read of a taskset.
    pub fn get_taskset(&self, spec: &str) -> Result<Taskset> {
        self.load(spec)
    }

    /// READY tasks ordered by dependency count ascending then priority
    /// descending, optionally filtered by skill.
    pub fn get_ready_tasks(&self, spec: &str, skill: Option<&str>) -> Result<Vec<Task>> {
        let taskset = self.load(spec)?;
        Ok(taskset.ready_tasks(skill).into_iter().cloned().collect())
    }

    /// Validate and apply a state transition.
    ///
    /// - `-> RUNNING` requires assignment metadata and stores it.
    /// - `-> DONE` clears assignment metadata and unblocks dependents.
    /// - `DONE -> READY` is the operator escape hatch and emits TaskReopened.
    pub fn update_task_state(
        &self,
        spec: &str,
        task_id: &TaskId,
        new_state: TaskState,
        metadata: Option<Assignment>,
    ) -> Result<()> {
        let _lock = self.write_lock(spec)?;
        let mut taskset = self.load(spec)?;

        let task = taskset
            .task(task_id)
            .ok_or_else(|| NecroError::TaskNotFound {
                spec: spec.to_string(),
                task_id: task_id.to_string(),
            })?;
        let from = task.state;

        if !from.can_transition_to(new_state) {
            warn!(spec, %task_id, %from, to = %new_state, "invalid transition rejected");
            return Err(NecroError::InvalidTransition {
                task_id: task_id.to_string(),
                from: from.to_string(),
                to: new_state.to_string(),
            });
        }

        if new_state == TaskState::Running {
            let assignment = metadata.ok_or_else(|| NecroError::MissingAssignment {
                task_id: task_id.to_string(),
                missing: "runner_id, slot_id, pool_name, branch_name".to_string(),
            })?;
            let task = taskset.task_mut(task_id).expect("task exists");
            task.assignment = Some(assignment);
        }

        let now = Utc::now();
        {
            let task = taskset.task_mut(task_id).expect("task exists");
            task.state = new_state;
            task.updated_at = now;
            if new_state == TaskState::Done {
                task.assignment = None;
            }
        }

        let mut unblocked = Vec::new();
        if new_state == TaskState::Done {
            unblocked = resolve_dependencies(&mut taskset);
        }

        self.store(&mut taskset)?;
        debug!(spec, %task_id, %from, to = %new_state, version = taskset.version, "state updated");

        let event_type = if from == TaskState::Done && new_state == TaskState::Ready {
            EventType::TaskReopened
        } else {
            EventType::TaskUpdated
        };
        self.journal.append(
            spec,
            &TaskEvent::new(task_id, event_type)
                .with_detail("from", from.to_string())
                .with_detail("to", new_state.to_string()),
        )?;

        for id in unblocked {
            self.journal
                .append(spec, &TaskEvent::new(&id, EventType::TaskReady))?;
        }

        Ok(())
    }

    /// Append an artifact reference to a task.
    pub fn add_artifact(&self, spec: &str, task_id: &TaskId, artifact: Artifact) -> Result<()> {
        let _lock = self.write_lock(spec)?;
        let mut taskset = self.load(spec)?;

        let task = taskset
            .task_mut(task_id)
            .ok_or_else(|| NecroError::TaskNotFound {
                spec: spec.to_string(),
                task_id: task_id.to_string(),
            })?;
        let kind = artifact.kind;
        let uri = artifact.uri.clone();
        task.artifacts.push(artifact);
        task.updated_at = Utc::now();

        self.store(&mut taskset)?;
        self.journal.append(
            spec,
            &TaskEvent::new(task_id, EventType::TaskUpdated)
                .with_detail("artifact", kind.to_string())
                .with_detail("uri", uri),
        )?;
        Ok(())
    }

    /// Journal an event without taking the registry write lock. Journal
    /// failures fall back to the local fallback journal (§ fallback logging).
    pub fn record_event(&self, spec: &str, event: &TaskEvent) -> Result<()> {
        self.journal.append(spec, event)
    }

    /// All spec names with a persisted taskset.
    pub fn list_specs(&self) -> Result<Vec<String>> {
        let dir = self.config.base_path.join("tasksets");
        let mut specs = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(spec) = name.strip_suffix(".json") {
                specs.push(spec.to_string());
            }
        }
        specs.sort();
        Ok(specs)
    }
}

/// Check that every dependency names a task in the same definition set.
fn validate_dependencies(definitions: &[TaskDefinition]) -> Result<()> {
    let ids: FxHashSet<&TaskId> = definitions.iter().map(|d| &d.id).collect();
    for def in definitions {
        for dep in &def.dependencies {
            if !ids.contains(dep) {
                return Err(NecroError::MissingDependency {
                    task_id: def.id.to_string(),
                    dep_id: dep.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// DFS cycle detection. Returns the cycle path including the repeated node,
/// e.g. `[A, B, A]`.
pub(crate) fn find_cycle(definitions: &[TaskDefinition]) -> Option<Vec<TaskId>> {
    let deps: FxHashMap<&TaskId, &BTreeSet<TaskId>> = definitions
        .iter()
        .map(|d| (&d.id, &d.dependencies))
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    let mut marks: FxHashMap<&TaskId, Mark> = FxHashMap::default();

    fn visit<'a>(
        id: &'a TaskId,
        deps: &FxHashMap<&'a TaskId, &'a BTreeSet<TaskId>>,
        marks: &mut FxHashMap<&'a TaskId, Mark>,
        path: &mut Vec<&'a TaskId>,
    ) -> Option<Vec<TaskId>> {
        match marks.get(id) {
            Some(Mark::Done) => return None,
            Some(Mark::InProgress) => {
                let start = path.iter().position(|p| *p == id).unwrap_or(0);
                let mut cycle: Vec<TaskId> = path[start..].iter().map(|p| (*p).clone()).collect();
                cycle.push(id.clone());
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(id, Mark::InProgress);
        path.push(id);
        if let Some(dep_set) = deps.get(id) {
            for dep in dep_set.iter() {
                // Unknown deps are reported separately; skip them here.
                if let Some((key, _)) = deps.get_key_value(dep) {
                    if let Some(cycle) = visit(*key, deps, marks, path) {
                        return Some(cycle);
                    }
                }
            }
        }
        path.pop();
        marks.insert(id, Mark::Done);
        None
    }

    let mut path = Vec::new();
    for def in definitions {
        if let Some(cycle) = visit(&def.id, &deps, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

/// Unblock every BLOCKED task whose dependencies are all DONE. Returns the
/// unblocked ids in taskset order.
fn resolve_dependencies(taskset: &mut Taskset) -> Vec<TaskId> {
    let done: FxHashSet<TaskId> = taskset
        .tasks
        .iter()
        .filter(|t| t.state == TaskState::Done)
        .map(|t| t.id.clone())
        .collect();

    let now = Utc::now();
    let mut unblocked = Vec::new();
    for task in &mut taskset.tasks {
        if task.state == TaskState::Blocked && task.dependencies.iter().all(|d| done.contains(d)) {
            task.state = TaskState::Ready;
            task.updated_at = now;
            unblocked.push(task.id.clone());
        }
    }
    unblocked
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn registry(dir: &Path) -> TaskRegistry {
        TaskRegistry::open(RegistryConfig {
            base_path: dir.to_path_buf(),
            ..RegistryConfig::default()
        })
        .unwrap()
    }

    fn assignment() -> Assignment {
        Assignment {
            runner_id: "runner-1".into(),
            slot_id: "local-0".into(),
            pool_name: "local".into(),
            branch_name: "feature/task-demo-1-x".into(),
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // create / get round trip
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn create_then_get_roundtrips() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());

        let created = reg
            .create_taskset(
                "demo",
                vec![
                    TaskDefinition::new("1", "Scaffold"),
                    TaskDefinition::new("2", "Implement").with_dependencies(["1"]),
                ],
            )
            .unwrap();

        let loaded = reg.get_taskset("demo").unwrap();
        assert_eq!(loaded, created);
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.task(&"1".into()).unwrap().state, TaskState::Ready);
        assert_eq!(loaded.task(&"2".into()).unwrap().state, TaskState::Blocked);
    }

    #[test]
    fn empty_taskset_has_version_one() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        let ts = reg.create_taskset("empty", vec![]).unwrap();
        assert_eq!(ts.version, 1);
        assert!(ts.tasks.is_empty());
    }

    #[test]
    fn duplicate_create_fails() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        reg.create_taskset("demo", vec![]).unwrap();
        let err = reg.create_taskset("demo", vec![]).unwrap_err();
        assert_eq!(err.code(), "NECRO-010");
    }

    #[test]
    fn create_emits_task_created_for_every_task() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        reg.create_taskset(
            "demo",
            vec![
                TaskDefinition::new("1", "a"),
                TaskDefinition::new("2", "b").with_dependencies(["1"]),
            ],
        )
        .unwrap();

        let events = reg.journal().read_all("demo").unwrap();
        let created: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == EventType::TaskCreated)
            .collect();
        assert_eq!(created.len(), 2);
    }

    // ═══════════════════════════════════════════════════════════════
    // Cycle rejection
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn two_task_cycle_rejected_with_path() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        let err = reg
            .create_taskset(
                "cyclic",
                vec![
                    TaskDefinition::new("A", "a").with_dependencies(["B"]),
                    TaskDefinition::new("B", "b").with_dependencies(["A"]),
                ],
            )
            .unwrap_err();

        match err {
            NecroError::CircularDependency { cycle } => {
                assert_eq!(cycle.len(), 3);
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"A".to_string()) && cycle.contains(&"B".to_string()));
            }
            other => panic!("expected CircularDependency, got {other}"),
        }
        // Nothing persisted.
        assert!(reg.get_taskset("cyclic").is_err());
    }

    #[test]
    fn self_dependency_rejected_as_circular() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        let err = reg
            .create_taskset(
                "selfdep",
                vec![TaskDefinition::new("A", "a").with_dependencies(["A"])],
            )
            .unwrap_err();
        assert_eq!(err.code(), "NECRO-014");
    }

    #[test]
    fn unknown_dependency_rejected() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        let err = reg
            .create_taskset(
                "missing",
                vec![TaskDefinition::new("A", "a").with_dependencies(["Z"])],
            )
            .unwrap_err();
        assert_eq!(err.code(), "NECRO-015");
    }

    // ═══════════════════════════════════════════════════════════════
    // Transitions and dependency resolution
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn running_requires_assignment_metadata() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        reg.create_taskset("demo", vec![TaskDefinition::new("1", "a")])
            .unwrap();

        let err = reg
            .update_task_state("demo", &"1".into(), TaskState::Running, None)
            .unwrap_err();
        assert_eq!(err.code(), "NECRO-017");

        reg.update_task_state("demo", &"1".into(), TaskState::Running, Some(assignment()))
            .unwrap();
        let ts = reg.get_taskset("demo").unwrap();
        let task = ts.task(&"1".into()).unwrap();
        assert_eq!(task.state, TaskState::Running);
        assert_eq!(task.assignment.as_ref().unwrap().runner_id, "runner-1");
    }

    #[test]
    fn done_clears_assignment_and_unblocks_dependents() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        reg.create_taskset(
            "demo",
            vec![
                TaskDefinition::new("1", "a"),
                TaskDefinition::new("2", "b").with_dependencies(["1"]),
                TaskDefinition::new("3", "c").with_dependencies(["1", "2"]),
            ],
        )
        .unwrap();

        reg.update_task_state("demo", &"1".into(), TaskState::Running, Some(assignment()))
            .unwrap();
        reg.update_task_state("demo", &"1".into(), TaskState::Done, None)
            .unwrap();

        let ts = reg.get_taskset("demo").unwrap();
        assert!(ts.task(&"1".into()).unwrap().assignment.is_none());
        assert_eq!(ts.task(&"2".into()).unwrap().state, TaskState::Ready);
        // 3 still waits on 2.
        assert_eq!(ts.task(&"3".into()).unwrap().state, TaskState::Blocked);

        let ready_events: Vec<_> = reg
            .journal()
            .read_all("demo")
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == EventType::TaskReady)
            .collect();
        assert_eq!(ready_events.len(), 1);
        assert_eq!(ready_events[0].task_id, "2");
    }

    #[test]
    fn invalid_transition_mutates_nothing() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        reg.create_taskset("demo", vec![TaskDefinition::new("1", "a")])
            .unwrap();
        let before = reg.get_taskset("demo").unwrap();

        let err = reg
            .update_task_state("demo", &"1".into(), TaskState::Done, None)
            .unwrap_err();
        assert_eq!(err.code(), "NECRO-013");

        let after = reg.get_taskset("demo").unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn version_strictly_increases_on_every_write() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        reg.create_taskset("demo", vec![TaskDefinition::new("1", "a")])
            .unwrap();
        let v1 = reg.get_taskset("demo").unwrap().version;

        reg.update_task_state("demo", &"1".into(), TaskState::Running, Some(assignment()))
            .unwrap();
        let v2 = reg.get_taskset("demo").unwrap().version;
        reg.update_task_state("demo", &"1".into(), TaskState::Done, None)
            .unwrap();
        let v3 = reg.get_taskset("demo").unwrap().version;

        assert!(v1 < v2 && v2 < v3);
    }

    #[test]
    fn done_to_ready_emits_task_reopened() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        reg.create_taskset("demo", vec![TaskDefinition::new("1", "a")])
            .unwrap();
        reg.update_task_state("demo", &"1".into(), TaskState::Running, Some(assignment()))
            .unwrap();
        reg.update_task_state("demo", &"1".into(), TaskState::Done, None)
            .unwrap();
        reg.update_task_state("demo", &"1".into(), TaskState::Ready, None)
            .unwrap();

        let events = reg.journal().read_all("demo").unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::TaskReopened && e.task_id == "1"));
    }

    // ═══════════════════════════════════════════════════════════════
    // Ready ordering and artifacts
    // ═══════════════════════════════════════════════════════════════

    #[test]
    fn ready_tasks_ordered_and_filtered() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        reg.create_taskset(
            "demo",
            vec![
                TaskDefinition::new("1", "a").with_skill("backend").with_priority(1),
                TaskDefinition::new("2", "b").with_skill("backend").with_priority(9),
                TaskDefinition::new("3", "c").with_skill("frontend"),
            ],
        )
        .unwrap();

        let backend = reg.get_ready_tasks("demo", Some("backend")).unwrap();
        let ids: Vec<&str> = backend.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["2", "1"]);
    }

    #[test]
    fn add_artifact_appends_and_journals() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        reg.create_taskset("demo", vec![TaskDefinition::new("1", "a")])
            .unwrap();

        reg.add_artifact(
            "demo",
            &"1".into(),
            Artifact {
                kind: task::ArtifactKind::Diff,
                uri: "file:///artifacts/demo/1.diff".into(),
                size_bytes: 512,
                metadata: Default::default(),
            },
        )
        .unwrap();

        let ts = reg.get_taskset("demo").unwrap();
        assert_eq!(ts.task(&"1".into()).unwrap().artifacts.len(), 1);
        let events = reg.journal().read_all("demo").unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::TaskUpdated
                && e.details.get("artifact").map(|v| v == "DIFF").unwrap_or(false)));
    }

    #[test]
    fn list_specs_enumerates_tasksets() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        reg.create_taskset("alpha", vec![]).unwrap();
        reg.create_taskset("beta", vec![]).unwrap();
        assert_eq!(reg.list_specs().unwrap(), ["alpha", "beta"]);
    }
}
