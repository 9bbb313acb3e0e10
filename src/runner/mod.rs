//! Agent Runner - end-to-end execution of one task in one slot
//!
//! Phase sequence:
//! 1. validate context (fail fast)
//! 2. prepare workspace (feature branch)
//! 3. invoke code generation and apply changes
//! 4. run tests
//! 5. commit and push
//! 6. upload artifacts (masked)
//! 7. report completion
//!
//! A wall-clock timeout bounds phases 2-6; resource ceilings are monitored
//! alongside. Cleanup (credentials, coordinator entry, state file) always
//! runs, even on the failure path.

pub mod artifacts;
pub mod codegen;
pub mod context;
pub mod coordinator;
pub mod gitops;
pub mod guard;
pub mod secrets;
pub mod state;
pub mod testing;
pub mod workspace;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Credentials, RegistryConfig, RunnerConfig};
use crate::error::{NecroError, Result};
use crate::registry::events::{EventType, TaskEvent};
use crate::registry::task::{TaskId, TaskState};
use crate::registry::TaskRegistry;
use crate::workspace::git::Git;

use artifacts::{upload_run_artifacts, ArtifactStore, LocalArtifactStore};
use codegen::CodeGenerator;
use context::RunnerContext;
use coordinator::RunnerCoordinator;
use guard::WorkspaceGuard;
use secrets::SecretMasker;
use state::{RunnerState, RunnerStateFile};
use testing::TestReport;

/// Result of one runner execution
#[derive(Debug)]
pub struct RunOutcome {
    pub success: bool,
    pub commit: Option<String>,
    pub test_report: Option<TestReport>,
    pub uploaded_artifacts: usize,
    pub execution_time: Duration,
    pub failure: Option<(String, String)>,
}

struct RunSummary {
    commit: String,
    test_report: Option<TestReport>,
    changes_applied: usize,
}

/// One-task worker operating inside an allocated slot
pub struct AgentRunner {
    ctx: RunnerContext,
    generator: Arc<dyn CodeGenerator>,
    store: Arc<dyn ArtifactStore>,
    masker: SecretMasker,
    registry: TaskRegistry,
    coordinator: Option<Arc<RunnerCoordinator>>,
    state: RunnerStateFile,
    credentials: Credentials,
    config: RunnerConfig,
    push_enabled: bool,
    log: Mutex<Vec<String>>,
}

impl AgentRunner {
    pub fn new(
        ctx: RunnerContext,
        config: RunnerConfig,
        credentials: Credentials,
        generator: Arc<dyn CodeGenerator>,
    ) -> Result<Self> {
        let registry = TaskRegistry::open(RegistryConfig {
            base_path: ctx.registry_base.clone(),
            ..RegistryConfig::default()
        })?;
        let store = Arc::new(LocalArtifactStore::new(&ctx.artifact_store_path));
        let masker = SecretMasker::new(&config.extra_secret_patterns, config.mask_secrets);
        let state = RunnerStateFile::new(
            &ctx.registry_base.join("runner-state"),
            &ctx.runner_id,
            &ctx.spec_name,
            &ctx.task_id,
            config.persist_state,
        );
        Ok(Self {
            ctx,
            generator,
            store,
            masker,
            registry,
            coordinator: None,
            state,
            credentials,
            config,
            push_enabled: true,
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn with_coordinator(mut self, coordinator: Arc<RunnerCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = store;
        self
    }

    /// Disable the push phase (offline fixtures, dry runs).
    pub fn without_push(mut self) -> Self {
        self.push_enabled = false;
        self
    }

    fn log_line(&self, phase: &str, message: &str) {
        info!(phase, task_id = %self.ctx.task_id, "{message}");
        self.log
            .lock()
            .push(format!("{} [{phase}] {message}", Utc::now().to_rfc3339()));
    }

    fn execution_log(&self) -> String {
        self.log.lock().join("\n")
    }

    /// Run the full phase sequence. The slot itself is owned by the caller;
    /// this only mutates its working tree.
    pub async fn execute(&mut self) -> RunOutcome {
        let started = Instant::now();

        // Phase 1: validation fails fast, before any state or event output.
        self.log_line("validate", "validating runner context");
        if let Err(e) = self.ctx.validate() {
            error!(error = %e, "context validation failed");
            return RunOutcome {
                success: false,
                commit: None,
                test_report: None,
                uploaded_artifacts: 0,
                execution_time: started.elapsed(),
                failure: Some(("validation".into(), e.to_string())),
            };
        }

        let result = self.guarded_run().await;
        let execution_time = started.elapsed();

        let outcome = match result {
            Ok(summary) => {
                let uploaded = self.report_success(&summary, execution_time).await;
                RunOutcome {
                    success: true,
                    commit: Some(summary.commit),
                    test_report: summary.test_report,
                    uploaded_artifacts: uploaded,
                    execution_time,
                    failure: None,
                }
            }
            Err(e) => {
                let category = error_category(&e);
                let uploaded = self.report_failure(category, &e, execution_time).await;
                RunOutcome {
                    success: false,
                    commit: None,
                    test_report: None,
                    uploaded_artifacts: uploaded,
                    execution_time,
                    failure: Some((category.to_string(), e.to_string())),
                }
            }
        };

        self.cleanup(outcome.success);
        outcome
    }

    /// State bookkeeping plus timeout/resource supervision around the phases.
    async fn guarded_run(&mut self) -> Result<RunSummary> {
        self.state.transition(RunnerState::Running)?;

        if let Some(coordinator) = &self.coordinator {
            coordinator.register(
                &self.ctx.runner_id,
                self.ctx.slot_path.clone(),
                &self.ctx.branch_name,
            )?;
        }

        let breach = Arc::new(Mutex::new(None::<NecroError>));
        let cancel = CancellationToken::new();
        let monitor = spawn_resource_monitor(
            self.config.max_memory_mb,
            self.config.max_cpu_percent,
            Arc::clone(&breach),
            cancel.clone(),
        );

        let timeout = self.ctx.timeout();
        let phases = self.run_phases();
        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, phases) => match result {
                Ok(inner) => inner,
                Err(_) => Err(NecroError::TaskTimeout {
                    task_id: self.ctx.task_id.clone(),
                    phase: "execution".to_string(),
                    timeout_secs: timeout.as_secs(),
                }),
            },
            _ = cancel.cancelled() => {
                Err(breach.lock().take().unwrap_or(NecroError::ResourceBreach {
                    resource: "unknown".into(),
                    observed: "unknown".into(),
                    limit: "unknown".into(),
                }))
            }
        };

        monitor.abort();
        outcome
    }

    /// Phases 2-5.
    async fn run_phases(&self) -> Result<RunSummary> {
        let git = Git::new(&self.ctx.slot_path);
        let guard = WorkspaceGuard::new(&self.ctx.slot_path, &self.ctx.branch_name);

        // Phase 2: workspace preparation. The slot arrives pre-cleaned by
        // the pool; only the feature branch is ours to create.
        self.log_line("workspace", &format!("creating branch {}", self.ctx.branch_name));
        workspace::prepare_branch(&git, &self.ctx).await?;
        self.heartbeat();

        // Phase 3: code generation.
        let files = workspace::list_workspace_files(&self.ctx.slot_path);
        let prompt = workspace::build_prompt(&self.ctx, &files);
        self.log_line(
            "codegen",
            &format!("requesting generation ({} workspace files in prompt)", files.len()),
        );
        let changes = self.generator.generate(&prompt).await?;
        let changes_applied = workspace::apply_changes(&guard, &changes)?;
        self.log_line("codegen", &format!("{changes_applied} changes applied"));
        self.heartbeat();

        // Phase 4: tests.
        let test_report = match self
            .ctx
            .test_command
            .as_deref()
            .or(self.config.default_test_command.as_deref())
        {
            Some(command) => {
                self.log_line("test", &format!("running: {command}"));
                let report = testing::run_tests(
                    &guard,
                    &self.ctx.slot_path,
                    command,
                    self.ctx.timeout(),
                )
                .await?;
                self.log_line(
                    "test",
                    &format!(
                        "exit {}: {} passed, {} failed, {} skipped",
                        report.exit_code, report.passed, report.failed, report.skipped
                    ),
                );
                if !report.all_passed() {
                    return Err(NecroError::TestsFailed {
                        total: report.total,
                        failed: report.failed.max(1),
                        details: report.failed_test_details.join(", "),
                    });
                }
                Some(report)
            }
            None => {
                self.log_line("test", "no test command configured, skipping");
                None
            }
        };
        self.heartbeat();

        // Phase 5: commit and push.
        let message = gitops::commit_message(&self.ctx.spec_name, &self.ctx.title, &self.ctx.task_id);
        let commit = gitops::commit_all(&git, &message)
            .await?
            .ok_or_else(|| NecroError::CodegenPermanent {
                reason: "generation produced no changes to commit".to_string(),
            })?;
        self.log_line("commit", &format!("committed {commit}"));

        if self.push_enabled {
            gitops::push_branch(&git, &guard, &self.ctx.branch_name).await?;
            self.log_line("push", &format!("pushed {}", self.ctx.branch_name));
        } else {
            self.log_line("push", "push disabled, skipping");
        }
        self.heartbeat();

        Ok(RunSummary {
            commit,
            test_report,
            changes_applied,
        })
    }

    /// Phase 6 + 7 on the success path: artifacts, registry DONE, events.
    /// Returns the number of uploaded artifacts.
    async fn report_success(&mut self, summary: &RunSummary, execution_time: Duration) -> usize {
        let git = Git::new(&self.ctx.slot_path);
        let diff = git.diff_of_commit(&summary.commit).await.ok();
        let test_json = summary
            .test_report
            .as_ref()
            .and_then(|r| serde_json::to_string_pretty(r).ok());

        let uploaded = upload_run_artifacts(
            self.store.as_ref(),
            &self.masker,
            &self.ctx.spec_name,
            &self.ctx.task_id,
            diff.as_deref(),
            &self.execution_log(),
            test_json.as_deref(),
        )
        .await;

        let task_id = TaskId::new(&self.ctx.task_id);
        for artifact in &uploaded {
            if let Err(e) = self
                .registry
                .add_artifact(&self.ctx.spec_name, &task_id, artifact.clone())
            {
                warn!(error = %e, "artifact registration failed");
            }
        }

        // An out-of-band operator rewrite makes this a state-transition
        // conflict; the completion report is rejected and logged, not fatal.
        match self
            .registry
            .update_task_state(&self.ctx.spec_name, &task_id, TaskState::Done, None)
        {
            Ok(()) => {
                let _ = self.registry.record_event(
                    &self.ctx.spec_name,
                    &TaskEvent::new(&task_id, EventType::TaskCompleted)
                        .with_detail("runner_id", self.ctx.runner_id.as_str())
                        .with_detail("execution_time_seconds", execution_time.as_secs_f64()),
                );
            }
            Err(e) => warn!(error = %e, "completion report rejected by registry"),
        }

        if let Err(e) = self.state.transition(RunnerState::Completed) {
            warn!(error = %e, "runner state transition failed");
        }
        info!(
            task_id = %self.ctx.task_id,
            commit = %summary.commit,
            changes = summary.changes_applied,
            "task completed"
        );
        uploaded.len()
    }

    /// Failure path: best-effort partial log upload plus TaskFailed event.
    /// Returns the number of uploaded artifacts.
    async fn report_failure(
        &mut self,
        category: &str,
        err: &NecroError,
        execution_time: Duration,
    ) -> usize {
        error!(task_id = %self.ctx.task_id, category, error = %err, "task failed");
        self.log_line("failure", &format!("[{category}] {err}"));

        let uploaded = upload_run_artifacts(
            self.store.as_ref(),
            &self.masker,
            &self.ctx.spec_name,
            &self.ctx.task_id,
            None,
            &self.execution_log(),
            None,
        )
        .await;
        if uploaded.is_empty() {
            warn!("partial log upload failed");
        }

        let task_id = TaskId::new(&self.ctx.task_id);
        let _ = self.registry.record_event(
            &self.ctx.spec_name,
            &TaskEvent::new(&task_id, EventType::TaskFailed)
                .with_detail("runner_id", self.ctx.runner_id.as_str())
                .with_detail("error_category", category)
                .with_detail("failure_reason", err.to_string())
                .with_detail("execution_time_seconds", execution_time.as_secs_f64()),
        );

        if self.state.state() == RunnerState::Running {
            if let Err(e) = self.state.transition(RunnerState::Failed) {
                warn!(error = %e, "runner state transition failed");
            }
        }
        uploaded.len()
    }

    /// Always runs, success or failure: credentials, coordinator entry, and
    /// the persisted state file.
    fn cleanup(&mut self, success: bool) {
        self.credentials.clear();
        if let Some(coordinator) = &self.coordinator {
            coordinator.deregister(&self.ctx.runner_id);
        }
        let _ = match self.state.state() {
            RunnerState::Completed | RunnerState::Failed => {
                self.state.transition(RunnerState::Idle)
            }
            _ => Ok(()),
        };
        if success {
            if let Err(e) = self.state.clear() {
                warn!(error = %e, "state file cleanup failed");
            }
        }
    }

    fn heartbeat(&self) {
        if let Some(coordinator) = &self.coordinator {
            coordinator.heartbeat(&self.ctx.runner_id);
        }
    }
}

/// Failure category recorded in TaskFailed events
fn error_category(err: &NecroError) -> &'static str {
    match err {
        NecroError::ContextInvalid { .. } => "validation",
        NecroError::BranchInUse { .. } => "workspace",
        NecroError::CodegenTransient { .. } => "codegen_transient",
        NecroError::CodegenPermanent { .. } => "codegen_permanent",
        NecroError::TestsFailed { .. } => "test_failed",
        NecroError::TestTimeout { .. } => "test_timeout",
        NecroError::TaskTimeout { .. } => "timeout",
        NecroError::ResourceBreach { .. } => "resources",
        NecroError::PushRejected { .. } => "push",
        NecroError::GitCommand { .. } | NecroError::GitTimeout { .. } => "git",
        NecroError::ResourceConflict { .. } => "coordination",
        NecroError::PathOutsideWorkspace { .. }
        | NecroError::GitInternalsAccess { .. }
        | NecroError::ForeignBranchPush { .. }
        | NecroError::DangerousCommand { .. } => "permissions",
        _ => "other",
    }
}

/// Poll process memory/CPU every few seconds; on breach, record the error and
/// cancel the run.
fn spawn_resource_monitor(
    max_memory_mb: Option<u64>,
    max_cpu_percent: Option<f64>,
    breach: Arc<Mutex<Option<NecroError>>>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if max_memory_mb.is_none() && max_cpu_percent.is_none() {
            return;
        }
        let pid = sysinfo::get_current_pid().ok();
        let Some(pid) = pid else { return };
        let mut system = sysinfo::System::new();

        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
            let Some(process) = system.process(pid) else {
                return;
            };

            if let Some(limit) = max_memory_mb {
                let used_mb = process.memory() / (1024 * 1024);
                if used_mb > limit {
                    *breach.lock() = Some(NecroError::ResourceBreach {
                        resource: "memory".into(),
                        observed: format!("{used_mb} MB"),
                        limit: format!("{limit} MB"),
                    });
                    cancel.cancel();
                    return;
                }
            }
            if let Some(limit) = max_cpu_percent {
                let cpu = process.cpu_usage() as f64;
                if cpu > limit {
                    *breach.lock() = Some(NecroError::ResourceBreach {
                        resource: "cpu".into(),
                        observed: format!("{cpu:.1}%"),
                        limit: format!("{limit:.1}%"),
                    });
                    cancel.cancel();
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::task::TaskDefinition;
    use crate::registry::task::Assignment;
    use codegen::MockCodeGenerator;
    use tempfile::tempdir;

    /// Full fixture: origin repo, cloned slot, registry with one RUNNING task.
    async fn fixture() -> (tempfile::TempDir, RunnerContext) {
        let dir = tempdir().unwrap();

        let origin = dir.path().join("origin");
        std::fs::create_dir_all(&origin).unwrap();
        let git = Git::new(&origin);
        git.run(&["init", "--initial-branch=main", "--bare"]).await.unwrap();

        let slot = dir.path().join("slot-0");
        let origin_url = origin.display().to_string();
        let seed = dir.path().join("seed");
        std::fs::create_dir_all(&seed).unwrap();
        let seed_git = Git::new(&seed);
        seed_git.run(&["init", "--initial-branch=main"]).await.unwrap();
        seed_git.run(&["config", "user.email", "ci@example.com"]).await.unwrap();
        seed_git.run(&["config", "user.name", "ci"]).await.unwrap();
        std::fs::write(seed.join("README.md"), "# seed\n").unwrap();
        seed_git.add_all().await.unwrap();
        seed_git.commit("initial").await.unwrap();
        seed_git.run(&["remote", "add", "origin", &origin_url]).await.unwrap();
        seed_git.push("main").await.unwrap();

        Git::clone_repo(&origin_url, &slot, Duration::from_secs(60))
            .await
            .unwrap();
        let slot_git = Git::new(&slot);
        slot_git.run(&["config", "user.email", "ci@example.com"]).await.unwrap();
        slot_git.run(&["config", "user.name", "ci"]).await.unwrap();

        let registry_base = dir.path().join("registry");
        let registry = TaskRegistry::open(RegistryConfig {
            base_path: registry_base.clone(),
            ..RegistryConfig::default()
        })
        .unwrap();
        registry
            .create_taskset(
                "demo",
                vec![TaskDefinition::new("1", "Scaffold the crate")
                    .with_description("Create the library skeleton")],
            )
            .unwrap();
        registry
            .update_task_state(
                "demo",
                &"1".into(),
                TaskState::Running,
                Some(Assignment {
                    runner_id: "runner-test".into(),
                    slot_id: "local-0".into(),
                    pool_name: "local".into(),
                    branch_name: "feature/task-demo-1-scaffold-the-crate".into(),
                }),
            )
            .unwrap();

        let mut ctx = context::tests::valid_context(slot.clone());
        ctx.runner_id = "runner-test".into();
        ctx.branch_name = "feature/task-demo-1-scaffold-the-crate".into();
        ctx.registry_base = registry_base;
        ctx.artifact_store_path = dir.path().join("artifacts");
        (dir, ctx)
    }

    #[tokio::test]
    async fn end_to_end_success_commits_and_reports_done() {
        let (dir, ctx) = fixture().await;
        let generator = Arc::new(MockCodeGenerator::new());
        generator.push_response(Ok(MockCodeGenerator::single_file(
            "src/lib.rs",
            "pub fn answer() -> u32 { 42 }\n",
        )));

        let mut runner = AgentRunner::new(
            ctx.clone(),
            RunnerConfig::default(),
            Credentials::default(),
            generator.clone(),
        )
        .unwrap();

        let outcome = runner.execute().await;
        assert!(outcome.success, "failure: {:?}", outcome.failure);
        assert!(outcome.commit.is_some());

        // The branch was pushed to origin.
        let origin_git = Git::new(dir.path().join("origin"));
        assert!(origin_git
            .branch_exists("feature/task-demo-1-scaffold-the-crate")
            .await
            .unwrap());

        // Registry shows DONE with artifacts and a TaskCompleted event.
        let registry = TaskRegistry::open(RegistryConfig {
            base_path: ctx.registry_base.clone(),
            ..RegistryConfig::default()
        })
        .unwrap();
        let ts = registry.get_taskset("demo").unwrap();
        let task = ts.task(&"1".into()).unwrap();
        assert_eq!(task.state, TaskState::Done);
        assert!(task.artifacts.len() >= 2, "expected diff+log artifacts");

        let events = registry.journal().read_all("demo").unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::TaskCompleted));

        // The prompt carried title and file listing.
        let prompts = generator.prompts_seen.lock();
        assert!(prompts[0].contains("Scaffold the crate"));
        assert!(prompts[0].contains("README.md"));
    }

    #[tokio::test]
    async fn permanent_codegen_failure_fails_task_with_category() {
        let (_dir, ctx) = fixture().await;
        let generator = Arc::new(MockCodeGenerator::new());
        generator.push_response(Err(NecroError::CodegenPermanent {
            reason: "authentication rejected".into(),
        }));

        let mut runner = AgentRunner::new(
            ctx.clone(),
            RunnerConfig::default(),
            Credentials::default(),
            generator,
        )
        .unwrap();

        let outcome = runner.execute().await;
        assert!(!outcome.success);
        let (category, reason) = outcome.failure.unwrap();
        assert_eq!(category, "codegen_permanent");
        assert!(reason.contains("authentication"));

        let registry = TaskRegistry::open(RegistryConfig {
            base_path: ctx.registry_base.clone(),
            ..RegistryConfig::default()
        })
        .unwrap();
        let events = registry.journal().read_all("demo").unwrap();
        let failed = events
            .iter()
            .find(|e| e.event_type == EventType::TaskFailed)
            .expect("TaskFailed event");
        assert_eq!(failed.details["error_category"], "codegen_permanent");
        // The task stays RUNNING; retry policy is the dispatcher's call.
        let ts = registry.get_taskset("demo").unwrap();
        assert_eq!(ts.task(&"1".into()).unwrap().state, TaskState::Running);
    }

    #[tokio::test]
    async fn failing_tests_fail_the_task() {
        let (_dir, mut ctx) = fixture().await;
        ctx.test_command = Some("exit 1".to_string());

        let mut runner = AgentRunner::new(
            ctx,
            RunnerConfig::default(),
            Credentials::default(),
            Arc::new(MockCodeGenerator::new()),
        )
        .unwrap();

        let outcome = runner.execute().await;
        assert!(!outcome.success);
        assert_eq!(outcome.failure.unwrap().0, "test_failed");
    }

    #[tokio::test]
    async fn invalid_context_fails_before_any_phase() {
        let (_dir, mut ctx) = fixture().await;
        ctx.title = String::new();

        let mut runner = AgentRunner::new(
            ctx,
            RunnerConfig::default(),
            Credentials::default(),
            Arc::new(MockCodeGenerator::new()),
        )
        .unwrap();

        let outcome = runner.execute().await;
        assert!(!outcome.success);
        assert_eq!(outcome.failure.unwrap().0, "validation");
    }

    #[tokio::test]
    async fn coordinator_conflict_fails_and_cleans_up() {
        let (_dir, ctx) = fixture().await;
        let coordinator = Arc::new(RunnerCoordinator::new());
        coordinator
            .register("other", ctx.slot_path.clone(), "feature/other")
            .unwrap();

        let mut runner = AgentRunner::new(
            ctx,
            RunnerConfig::default(),
            Credentials::default(),
            Arc::new(MockCodeGenerator::new()),
        )
        .unwrap()
        .with_coordinator(Arc::clone(&coordinator));

        let outcome = runner.execute().await;
        assert!(!outcome.success);
        assert_eq!(outcome.failure.unwrap().0, "coordination");
        // Only the prior registration remains.
        assert_eq!(coordinator.len(), 1);
        assert!(coordinator.is_registered("other"));
    }

    #[tokio::test]
    async fn timeout_interrupts_execution() {
        let (_dir, mut ctx) = fixture().await;
        ctx.timeout_secs = 1;
        ctx.test_command = Some("sleep 30".to_string());

        let mut runner = AgentRunner::new(
            ctx,
            RunnerConfig::default(),
            Credentials::default(),
            Arc::new(MockCodeGenerator::new()),
        )
        .unwrap();

        let outcome = runner.execute().await;
        assert!(!outcome.success);
        let (category, _) = outcome.failure.unwrap();
        assert!(category == "timeout" || category == "test_timeout");
    }
}
