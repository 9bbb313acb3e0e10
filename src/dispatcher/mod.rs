//! Dispatcher - drives READY tasks to terminal states
//!
//! One supervisory loop: poll the registry, dispatch under concurrency caps,
//! observe completions (notification channel) and losses (heartbeat
//! timeouts), retry with backoff, and shut down gracefully on request or
//! signal. No error in a handler ever kills the loop; everything is logged
//! and the next tick continues.

pub mod agent_pool;
pub mod deadlock;
pub mod launcher;
pub mod metrics;
pub mod monitor;
pub mod queue;
pub mod retry;
pub mod scheduler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::NecroConfig;
use crate::error::{NecroError, Result};
use crate::registry::events::{EventType, TaskEvent};
use crate::registry::task::{Assignment, Task, TaskId, TaskState};
use crate::registry::TaskRegistry;
use crate::runner::context::RunnerContext;
use crate::runner::workspace::feature_branch_name;
use crate::workspace::{AllocatedSlot, CleanupMode, WorkspacePool};

use agent_pool::AgentPoolManager;
use launcher::{
    generate_runner_id, CompletionReport, LaunchSpec, LaunchedRunner, RunnerLauncher,
};
use metrics::MetricsCollector;
use monitor::{MonitoredRunner, RunnerMonitor};
use queue::{QueuedTask, TaskQueue};
use retry::{RetryManager, RetryPolicy};
use scheduler::Scheduler;

/// Book-keeping for one in-flight runner
struct ActiveRun {
    spec: String,
    task_id: TaskId,
    pool_name: String,
    slot: AllocatedSlot,
    launched: LaunchedRunner,
}

/// The task-execution supervisor
pub struct Dispatcher {
    config: NecroConfig,
    registry: Arc<TaskRegistry>,
    workspace: Arc<WorkspacePool>,
    launcher: Arc<dyn RunnerLauncher>,
    monitor: Arc<RunnerMonitor>,
    queue: TaskQueue,
    retry: RetryManager,
    pools: AgentPoolManager,
    scheduler: Scheduler,
    metrics: MetricsCollector,
    active: DashMap<String, ActiveRun>,
    completion_rx: tokio::sync::Mutex<UnboundedReceiver<CompletionReport>>,
    shutdown: AtomicBool,
    wake: Notify,
}

impl Dispatcher {
    /// The completion channel pair shared with the launcher.
    pub fn completion_channel() -> (UnboundedSender<CompletionReport>, UnboundedReceiver<CompletionReport>)
    {
        mpsc::unbounded_channel()
    }

    pub fn new(
        config: NecroConfig,
        registry: Arc<TaskRegistry>,
        workspace: Arc<WorkspacePool>,
        launcher: Arc<dyn RunnerLauncher>,
        monitor: Arc<RunnerMonitor>,
        completion_rx: UnboundedReceiver<CompletionReport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let retry = RetryManager::new(RetryPolicy {
            max_attempts: config.dispatcher.retry_max_attempts,
            initial_delay: Duration::from_secs(config.dispatcher.retry_initial_delay_secs),
            max_delay: Duration::from_secs(config.dispatcher.retry_max_delay_secs),
            backoff_base: config.dispatcher.retry_backoff_base,
        });
        let pools = AgentPoolManager::new(config.agent_pools.clone());
        let scheduler = Scheduler::new(config.dispatcher.scheduling_policy, config.skills.clone());

        Ok(Arc::new(Self {
            config,
            registry,
            workspace,
            launcher,
            monitor,
            queue: TaskQueue::new(),
            retry,
            pools,
            scheduler,
            metrics: MetricsCollector::new(),
            active: DashMap::new(),
            completion_rx: tokio::sync::Mutex::new(completion_rx),
            shutdown: AtomicBool::new(false),
            wake: Notify::new(),
        }))
    }

    // ═══════════════════════════════════════════════════════════════
    // External control surface
    // ═══════════════════════════════════════════════════════════════

    /// Request shutdown. Idempotent; safe before `run` has started.
    pub fn stop(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!("dispatcher stop requested");
        }
        self.wake.notify_waiters();
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Re-prioritize a queued task at runtime.
    pub fn update_priority(&self, spec: &str, task_id: &TaskId, priority: i32) -> bool {
        self.queue.update_priority(spec, task_id, priority)
    }

    /// Swap the scheduling policy; in-flight work is unaffected.
    pub fn set_policy(&self, policy: crate::config::SchedulingPolicy) {
        self.scheduler.set_policy(policy);
    }

    pub fn running_count(&self) -> usize {
        self.active.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Prometheus text snapshot.
    pub fn metrics_text(&self) -> String {
        self.refresh_metrics();
        self.metrics.render_prometheus()
    }

    fn refresh_metrics(&self) {
        self.metrics.set_queue_size(self.queue.len());
        self.metrics.set_global_running(self.active.len());
        self.metrics.set_pool_snapshot(self.pools.snapshot());
        self.metrics
            .set_journal_fallbacks(self.registry.journal().fallback_count());
    }

    // ═══════════════════════════════════════════════════════════════
    // Main loop
    // ═══════════════════════════════════════════════════════════════

    /// Run until `stop()`; then drain gracefully. Exits cleanly even when
    /// individual ticks fail.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let mut rx = self.completion_rx.lock().await;
        let poll_interval = self.config.dispatcher.poll_interval();
        let deadlock_every = self.config.dispatcher.deadlock_detection_interval_ticks.max(1);
        let mut tick: u64 = 0;

        info!(
            pools = self.pools.names().len(),
            max_global = self.config.dispatcher.max_global_concurrency,
            policy = ?self.scheduler.policy(),
            "dispatcher started"
        );

        while !self.is_stopping() {
            if let Err(e) = self.poll_ready_tasks() {
                warn!(error = %e, "ready-task poll failed");
            }
            self.dispatch_tick().await;

            for timed_out in self.monitor.tick() {
                self.handle_timeout(timed_out).await;
            }

            if tick % deadlock_every == 0 {
                deadlock::scan(&self.registry);
            }
            self.refresh_metrics();
            tick += 1;

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = self.wake.notified() => {}
                Some(report) = rx.recv() => {
                    self.handle_completion(report).await;
                    while let Ok(more) = rx.try_recv() {
                        self.handle_completion(more).await;
                    }
                }
            }
        }

        self.graceful_shutdown(&mut rx).await;
        info!(
            completed = self.metrics.completed_count(),
            failed = self.metrics.failed_count(),
            "dispatcher exited"
        );
        Ok(())
    }

    /// Run with SIGINT/SIGTERM installed; intended for a main-thread host.
    /// Worker-thread embeddings call `run()` and `stop()` directly.
    pub async fn run_until_signal(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received");
            this.stop();
        });
        self.run().await
    }

    // ═══════════════════════════════════════════════════════════════
    // Polling and dispatch
    // ═══════════════════════════════════════════════════════════════

    /// Enqueue READY tasks across all specs. The queue rejects duplicates,
    /// so blind re-offering every tick is safe.
    fn poll_ready_tasks(&self) -> Result<()> {
        for spec in self.registry.list_specs()? {
            let ready = match self.registry.get_ready_tasks(&spec, None) {
                Ok(ready) => ready,
                Err(e) => {
                    warn!(spec = %spec, error = %e, "skipping spec this tick");
                    continue;
                }
            };
            for task in ready {
                if self.is_active(&spec, &task.id) {
                    continue;
                }
                if self.queue.push(
                    &spec,
                    task.id.clone(),
                    task.priority,
                    &task.required_skill,
                    task.created_at,
                ) {
                    debug!(spec = %spec, task_id = %task.id, "task enqueued");
                }
            }
        }
        Ok(())
    }

    fn is_active(&self, spec: &str, task_id: &TaskId) -> bool {
        self.active
            .iter()
            .any(|run| run.spec == spec && &run.task_id == task_id)
    }

    /// Assign as many queued tasks as capacity allows this tick.
    async fn dispatch_tick(&self) {
        loop {
            if self.is_stopping() {
                return;
            }
            if self.active.len() >= self.config.dispatcher.max_global_concurrency {
                return;
            }
            let Some(head) = self.queue.peek() else { return };

            // Backoff gate: a retrying task stays queued until eligible.
            let key = head.key();
            if self.retry.attempts(&key) > 0 && !self.retry.is_eligible(&key) {
                return;
            }

            let Some(pool_name) = self
                .scheduler
                .select_pool(&head.required_skill, &self.pools)
            else {
                // Saturated for this skill; stop this tick, retry next tick.
                return;
            };

            let Some(task) = self.queue.pop() else { return };
            if let Err(e) = self.assign(task, &pool_name).await {
                if matches!(e, NecroError::NoSlotsAvailable { .. }) {
                    debug!(pool = %pool_name, "no slots available, task re-queued");
                    // No tight spin on an empty pool.
                    return;
                }
                warn!(error = %e, "assignment failed");
            }
        }
    }

    /// One assignment: reserve pool capacity, allocate a slot, flip the task
    /// to RUNNING, and launch.
    async fn assign(&self, task: QueuedTask, pool_name: &str) -> Result<()> {
        let pool = self.pools.get(pool_name)?;
        pool.acquire()?;

        let runner_id = generate_runner_id();
        let workspace_pool = pool
            .config
            .type_specific
            .get("workspace_pool")
            .cloned()
            .unwrap_or_else(|| pool.config.name.clone());

        let slot = match self.workspace.allocate_slot(&workspace_pool, &runner_id).await {
            Ok(slot) => slot,
            Err(e) => {
                pool.release();
                // Re-enqueue with priority unchanged.
                self.queue.push(
                    &task.spec,
                    task.task_id.clone(),
                    task.priority,
                    &task.required_skill,
                    task.created_at,
                );
                return Err(e);
            }
        };

        let full = match self.full_task(&task.spec, &task.task_id) {
            Ok(full) => full,
            Err(e) => {
                pool.release();
                let _ = self.workspace.release_slot(slot, CleanupMode::Skip).await;
                return Err(e);
            }
        };

        let branch_name = feature_branch_name(&task.spec, task.task_id.as_str(), &full.title);
        let assignment = Assignment {
            runner_id: runner_id.clone(),
            slot_id: slot.slot_id.clone(),
            pool_name: pool_name.to_string(),
            branch_name: branch_name.clone(),
        };

        // RUNNING before launch keeps every later outcome inside the state
        // machine (RUNNING -> READY for retry, RUNNING -> FAILED terminal).
        if let Err(e) = self.registry.update_task_state(
            &task.spec,
            &task.task_id,
            TaskState::Running,
            Some(assignment),
        ) {
            pool.release();
            let _ = self.workspace.release_slot(slot, CleanupMode::Skip).await;
            return Err(e);
        }

        let ctx = RunnerContext {
            runner_id: runner_id.clone(),
            spec_name: task.spec.clone(),
            task_id: task.task_id.as_str().to_string(),
            title: full.title.clone(),
            description: full.description.clone(),
            acceptance_criteria: full.acceptance_criteria.clone(),
            required_skill: full.required_skill.clone(),
            pool_name: pool_name.to_string(),
            slot_id: slot.slot_id.clone(),
            slot_path: slot.path.clone(),
            branch_name: branch_name.clone(),
            timeout_secs: self.config.runner.default_task_timeout_secs,
            test_command: self.config.runner.default_test_command.clone(),
            registry_base: self.config.registry.base_path.clone(),
            artifact_store_path: self.config.runner.artifact_store_path.clone(),
        };

        self.monitor
            .register(&runner_id, &task.spec, task.task_id.as_str());

        let launched = match self
            .launcher
            .launch(LaunchSpec {
                ctx,
                pool: pool.config.clone(),
                credentials: self.config.credentials.clone(),
            })
            .await
        {
            Ok(launched) => launched,
            Err(e) => {
                self.monitor.remove(&runner_id);
                pool.release();
                self.metrics.launch_failure();
                let _ = self.workspace.release_slot(slot, CleanupMode::Skip).await;
                self.fail_or_requeue(&task.spec, &task.task_id, &runner_id, &e.to_string())
                    .await;
                return Err(e);
            }
        };

        let _ = self.registry.record_event(
            &task.spec,
            &TaskEvent::assigned(&task.task_id, &runner_id, &slot.slot_id, pool_name),
        );
        let handle_detail = match &launched.handle {
            launcher::RunnerHandle::Pid(pid) => ("pid", pid.to_string()),
            launcher::RunnerHandle::Container(id) => ("container_id", id.clone()),
            launcher::RunnerHandle::Job(name) => ("job_name", name.clone()),
        };
        let _ = self.registry.record_event(
            &task.spec,
            &TaskEvent::new(&task.task_id, EventType::RunnerStarted)
                .with_detail("runner_id", runner_id.as_str())
                .with_detail("slot_id", slot.slot_id.as_str())
                .with_detail("pool_name", pool_name)
                .with_detail(handle_detail.0, handle_detail.1),
        );

        let waited = (Utc::now() - task.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.metrics.task_assigned(waited);

        info!(
            spec = %task.spec,
            task_id = %task.task_id,
            runner_id = %runner_id,
            pool = pool_name,
            slot = %slot.slot_id,
            "task assigned"
        );

        self.active.insert(
            runner_id.clone(),
            ActiveRun {
                spec: task.spec,
                task_id: task.task_id,
                pool_name: pool_name.to_string(),
                slot,
                launched,
            },
        );
        Ok(())
    }

    fn full_task(&self, spec: &str, task_id: &TaskId) -> Result<Task> {
        let taskset = self.registry.get_taskset(spec)?;
        taskset
            .task(task_id)
            .cloned()
            .ok_or_else(|| NecroError::TaskNotFound {
                spec: spec.to_string(),
                task_id: task_id.to_string(),
            })
    }

    // ═══════════════════════════════════════════════════════════════
    // Completion and failure paths
    // ═══════════════════════════════════════════════════════════════

    async fn handle_completion(&self, report: CompletionReport) {
        let Some((_, run)) = self.active.remove(&report.runner_id) else {
            // Already handled via timeout, or a stale report after shutdown.
            debug!(runner_id = %report.runner_id, "completion for unknown runner");
            return;
        };
        self.monitor.remove(&report.runner_id);
        if let Ok(pool) = self.pools.get(&run.pool_name) {
            pool.release();
        }
        if let Err(e) = self
            .workspace
            .release_slot(run.slot, CleanupMode::Background)
            .await
        {
            warn!(error = %e, "slot release failed");
        }

        let task_id = TaskId::new(&report.task_id);
        let key = format!("{}/{}", report.spec, report.task_id);

        let _ = self.registry.record_event(
            &report.spec,
            &TaskEvent::runner_finished(
                &task_id,
                report.success,
                report.execution_time_seconds,
                report.failure_reason.as_deref(),
            ),
        );

        if report.success {
            // Subprocess runners report DONE themselves; only finish the
            // transition when the task is still RUNNING (stub launchers,
            // crashed-after-push runners).
            let state = self
                .registry
                .get_taskset(&report.spec)
                .ok()
                .and_then(|ts| ts.task(&task_id).map(|t| t.state));
            if state == Some(TaskState::Running) {
                match self.registry.update_task_state(
                    &report.spec,
                    &task_id,
                    TaskState::Done,
                    None,
                ) {
                    Ok(()) => {
                        let _ = self.registry.record_event(
                            &report.spec,
                            &TaskEvent::new(&task_id, EventType::TaskCompleted)
                                .with_detail("runner_id", report.runner_id.as_str())
                                .with_detail(
                                    "execution_time_seconds",
                                    report.execution_time_seconds,
                                ),
                        );
                    }
                    Err(e) => warn!(error = %e, "completion transition rejected"),
                }
            }
            self.retry.clear(&key);
            self.metrics.task_completed();
            info!(spec = %report.spec, task_id = %report.task_id, "task completed");
        } else {
            let reason = report
                .failure_reason
                .unwrap_or_else(|| "unknown failure".to_string());
            self.fail_or_requeue(&report.spec, &task_id, &report.runner_id, &reason)
                .await;
        }

        // Dependents may have become READY; wake the loop.
        self.wake.notify_one();
    }

    async fn handle_timeout(&self, timed_out: MonitoredRunner) {
        warn!(
            runner_id = %timed_out.runner_id,
            spec = %timed_out.spec,
            task_id = %timed_out.task_id,
            "runner heartbeat timeout"
        );
        self.metrics.runner_timeout();

        let Some((_, run)) = self.active.remove(&timed_out.runner_id) else {
            return;
        };
        if let Err(e) = self.launcher.terminate(&run.launched).await {
            // Timeout-handler failures are swallowed and logged.
            error!(error = %e, "force-terminate failed");
        }
        if let Ok(pool) = self.pools.get(&run.pool_name) {
            pool.release();
        }
        if let Err(e) = self
            .workspace
            .release_slot(run.slot, CleanupMode::Background)
            .await
        {
            warn!(error = %e, "slot release failed");
        }

        let _ = self.registry.record_event(
            &run.spec,
            &TaskEvent::runner_finished(&run.task_id, false, 0.0, Some("heartbeat_timeout")),
        );
        self.fail_or_requeue(&run.spec, &run.task_id, &timed_out.runner_id, "heartbeat_timeout")
            .await;
    }

    /// Shared failure path: consult the retry budget, then either reset the
    /// task for retry or mark it FAILED.
    async fn fail_or_requeue(&self, spec: &str, task_id: &TaskId, runner_id: &str, reason: &str) {
        let key = format!("{spec}/{task_id}");
        let record = self.retry.record_failure(&key, reason);

        let current = self
            .registry
            .get_taskset(spec)
            .ok()
            .and_then(|ts| ts.task(task_id).map(|t| t.state));

        if self.retry.can_retry(&key) {
            self.metrics.task_retried();
            if current == Some(TaskState::Running) {
                if let Err(e) =
                    self.registry
                        .update_task_state(spec, task_id, TaskState::Ready, None)
                {
                    warn!(error = %e, "retry reset failed");
                    return;
                }
            }
            info!(
                spec,
                %task_id,
                attempt = record.attempt_count,
                reason,
                "task will retry after backoff"
            );
        } else {
            self.metrics.task_failed();
            if current == Some(TaskState::Running) {
                if let Err(e) =
                    self.registry
                        .update_task_state(spec, task_id, TaskState::Failed, None)
                {
                    warn!(error = %e, "failure transition rejected");
                }
            }
            let _ = self.registry.record_event(
                spec,
                &TaskEvent::new(task_id, EventType::TaskFailed)
                    .with_detail("runner_id", runner_id)
                    .with_detail("failure_reason", reason)
                    .with_detail("retry_count", record.attempt_count),
            );
            warn!(spec, %task_id, reason, attempts = record.attempt_count, "task failed terminally");
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Shutdown
    // ═══════════════════════════════════════════════════════════════

    async fn graceful_shutdown(&self, rx: &mut UnboundedReceiver<CompletionReport>) {
        let timeout = self.config.dispatcher.graceful_shutdown_timeout();
        let deadline = Instant::now() + timeout;
        info!(
            in_flight = self.active.len(),
            timeout_secs = timeout.as_secs(),
            "graceful shutdown: waiting for in-flight runners"
        );

        while !self.active.is_empty() && Instant::now() < deadline {
            tokio::select! {
                Some(report) = rx.recv() => self.handle_completion(report).await,
                _ = tokio::time::sleep(Duration::from_millis(250)) => {
                    for timed_out in self.monitor.tick() {
                        self.handle_timeout(timed_out).await;
                    }
                }
            }
        }

        let remaining: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        if !remaining.is_empty() {
            warn!(
                remaining = remaining.len(),
                "graceful deadline passed, force-terminating"
            );
        }
        for runner_id in remaining {
            let Some((_, run)) = self.active.remove(&runner_id) else {
                continue;
            };
            if let Err(e) = self.launcher.terminate(&run.launched).await {
                error!(error = %e, "force-terminate failed");
            }
            self.monitor.remove(&runner_id);
            if let Ok(pool) = self.pools.get(&run.pool_name) {
                pool.release();
            }
            let _ = self.workspace.release_slot(run.slot, CleanupMode::Skip).await;

            // Partial commits may exist; the retry record is updated per
            // policy through the shared failure path.
            let _ = self.registry.record_event(
                &run.spec,
                &TaskEvent::runner_finished(&run.task_id, false, 0.0, Some("shutdown_timeout")),
            );
            self.fail_or_requeue(&run.spec, &run.task_id, &runner_id, "shutdown_timeout")
                .await;
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
