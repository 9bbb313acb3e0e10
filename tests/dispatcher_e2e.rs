//! End-to-end dispatcher scenarios against a real registry and a real
//! worktree pool, with runner execution stubbed at the launcher seam.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serial_test::serial;
use tokio::sync::mpsc::UnboundedSender;

use necrocode::config::{
    AgentPoolConfig, AgentPoolKind, DispatcherConfig, NecroConfig, RegistryConfig,
    SchedulingPolicy, WorkspaceConfig,
};
use necrocode::dispatcher::launcher::{
    CompletionReport, LaunchSpec, LaunchedRunner, RunnerHandle, RunnerLauncher,
};
use necrocode::dispatcher::monitor::RunnerMonitor;
use necrocode::dispatcher::Dispatcher;
use necrocode::error::Result;
use necrocode::registry::events::EventType;
use necrocode::registry::task::{TaskDefinition, TaskState};
use necrocode::registry::TaskRegistry;
use necrocode::workspace::git::Git;
use necrocode::workspace::{SlotState, WorkspacePool};

// ═══════════════════════════════════════════════════════════════
// Stub launcher
// ═══════════════════════════════════════════════════════════════

#[derive(Clone)]
enum Behavior {
    Succeed(Duration),
    Fail(Duration, String),
    /// Never report, never heartbeat; the monitor must reap it.
    Hang,
}

struct StubLauncher {
    tx: UnboundedSender<CompletionReport>,
    behaviors: Mutex<HashMap<String, Vec<Behavior>>>,
    launches: Mutex<Vec<String>>,
}

impl StubLauncher {
    fn new(tx: UnboundedSender<CompletionReport>) -> Self {
        Self {
            tx,
            behaviors: Mutex::new(HashMap::new()),
            launches: Mutex::new(Vec::new()),
        }
    }

    /// Queue per-attempt behaviors for a task id; defaults to a fast success.
    fn behave(&self, task_id: &str, behaviors: Vec<Behavior>) {
        self.behaviors
            .lock()
            .insert(task_id.to_string(), behaviors);
    }

    fn launch_order(&self) -> Vec<String> {
        self.launches.lock().clone()
    }
}

#[async_trait::async_trait]
impl RunnerLauncher for StubLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<LaunchedRunner> {
        self.launches.lock().push(spec.ctx.task_id.clone());
        let behavior = {
            let mut behaviors = self.behaviors.lock();
            match behaviors.get_mut(&spec.ctx.task_id) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => Behavior::Succeed(Duration::from_millis(20)),
            }
        };

        let tx = self.tx.clone();
        let started = Instant::now();
        let runner_id = spec.ctx.runner_id.clone();
        let pool_name = spec.pool.name.clone();
        match behavior {
            Behavior::Hang => {}
            Behavior::Succeed(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(CompletionReport {
                        runner_id: spec.ctx.runner_id.clone(),
                        spec: spec.ctx.spec_name.clone(),
                        task_id: spec.ctx.task_id.clone(),
                        success: true,
                        failure_reason: None,
                        execution_time_seconds: started.elapsed().as_secs_f64(),
                    });
                });
            }
            Behavior::Fail(delay, reason) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(CompletionReport {
                        runner_id: spec.ctx.runner_id.clone(),
                        spec: spec.ctx.spec_name.clone(),
                        task_id: spec.ctx.task_id.clone(),
                        success: false,
                        failure_reason: Some(reason),
                        execution_time_seconds: started.elapsed().as_secs_f64(),
                    });
                });
            }
        }

        Ok(LaunchedRunner {
            runner_id,
            pool_name,
            handle: RunnerHandle::Pid(0),
        })
    }

    async fn terminate(&self, _runner: &LaunchedRunner) -> Result<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
// Fixture
// ═══════════════════════════════════════════════════════════════

struct Fixture {
    _dir: tempfile::TempDir,
    registry: Arc<TaskRegistry>,
    workspace: Arc<WorkspacePool>,
    launcher: Arc<StubLauncher>,
    dispatcher: Arc<Dispatcher>,
}

async fn fixture(pool_capacity: usize, tune: impl FnOnce(&mut DispatcherConfig)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();

    let origin = dir.path().join("origin");
    std::fs::create_dir_all(&origin).unwrap();
    let git = Git::new(&origin);
    git.run(&["init", "--initial-branch=main"]).await.unwrap();
    git.run(&["config", "user.email", "ci@example.com"]).await.unwrap();
    git.run(&["config", "user.name", "ci"]).await.unwrap();
    std::fs::write(origin.join("README.md"), "# fixture\n").unwrap();
    git.add_all().await.unwrap();
    git.commit("initial").await.unwrap();

    let workspace = Arc::new(WorkspacePool::new(WorkspaceConfig {
        base_path: dir.path().join("pools"),
        num_slots_per_pool: pool_capacity.max(1),
        cleanup_timeout_secs: 60,
        allocation_lock_timeout_ms: 500,
        background_cleanup_workers: 2,
    }));
    workspace
        .create_pool("local", &origin.display().to_string(), pool_capacity.max(1))
        .await
        .unwrap();

    let registry = Arc::new(
        TaskRegistry::open(RegistryConfig {
            base_path: dir.path().join("registry"),
            ..RegistryConfig::default()
        })
        .unwrap(),
    );

    let mut dispatcher_config = DispatcherConfig {
        poll_interval_secs: 1,
        scheduling_policy: SchedulingPolicy::SkillBased,
        max_global_concurrency: 8,
        heartbeat_timeout_secs: 60,
        graceful_shutdown_timeout_secs: 10,
        ..DispatcherConfig::default()
    };
    tune(&mut dispatcher_config);

    let config = NecroConfig {
        dispatcher: dispatcher_config,
        agent_pools: vec![AgentPoolConfig {
            name: "local".into(),
            kind: AgentPoolKind::LocalProcess,
            max_concurrency: pool_capacity,
            cpu_quota: None,
            memory_quota_mb: None,
            enabled: true,
            type_specific: HashMap::new(),
        }],
        skills: HashMap::from([
            ("default".to_string(), vec!["local".to_string()]),
            ("backend".to_string(), vec!["local".to_string()]),
        ]),
        workspace: WorkspaceConfig {
            base_path: dir.path().join("pools"),
            ..WorkspaceConfig::default()
        },
        registry: RegistryConfig {
            base_path: dir.path().join("registry"),
            ..RegistryConfig::default()
        },
        ..NecroConfig::default()
    };

    let monitor = Arc::new(RunnerMonitor::new(
        config.dispatcher.heartbeat_timeout(),
    ));
    let (tx, rx) = Dispatcher::completion_channel();
    let launcher = Arc::new(StubLauncher::new(tx));

    let dispatcher = Dispatcher::new(
        config,
        Arc::clone(&registry),
        Arc::clone(&workspace),
        Arc::clone(&launcher) as Arc<dyn RunnerLauncher>,
        monitor,
        rx,
    )
    .unwrap();

    Fixture {
        _dir: dir,
        registry,
        workspace,
        launcher,
        dispatcher,
    }
}

/// Drive the dispatcher until `done` returns true or the deadline passes.
async fn run_until(fixture: &Fixture, deadline: Duration, done: impl Fn(&Fixture) -> bool) {
    let dispatcher = Arc::clone(&fixture.dispatcher);
    let handle = tokio::spawn(async move { dispatcher.run().await });

    let started = Instant::now();
    while started.elapsed() < deadline {
        if done(fixture) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    fixture.dispatcher.stop();
    handle.await.unwrap().unwrap();
}

fn states(fixture: &Fixture, spec: &str) -> HashMap<String, TaskState> {
    fixture
        .registry
        .get_taskset(spec)
        .unwrap()
        .tasks
        .iter()
        .map(|t| (t.id.as_str().to_string(), t.state))
        .collect()
}

// ═══════════════════════════════════════════════════════════════
// Scenarios
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
#[serial]
async fn linear_three_task_spec_completes_in_dependency_order() {
    let fx = fixture(1, |_| {}).await;
    fx.registry
        .create_taskset(
            "chain",
            vec![
                TaskDefinition::new("1", "first").with_skill("backend"),
                TaskDefinition::new("2", "second")
                    .with_skill("backend")
                    .with_dependencies(["1"]),
                TaskDefinition::new("3", "third")
                    .with_skill("backend")
                    .with_dependencies(["2"]),
            ],
        )
        .unwrap();

    run_until(&fx, Duration::from_secs(30), |fx| {
        fx.registry.get_taskset("chain").unwrap().all_done()
    })
    .await;

    let states = states(&fx, "chain");
    assert!(states.values().all(|s| *s == TaskState::Done), "{states:?}");
    assert_eq!(fx.launcher.launch_order(), ["1", "2", "3"]);

    // Event journal: created x3, then per-task assigned/started/finished/
    // completed in dependency order, with TaskReady on each unblock.
    let events = fx.registry.journal().read_all("chain").unwrap();
    let created: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::TaskCreated)
        .collect();
    assert_eq!(created.len(), 3);

    let position = |kind: EventType, task: &str| {
        events
            .iter()
            .position(|e| e.event_type == kind && e.task_id == task)
            .unwrap_or_else(|| panic!("missing {kind:?} for {task}"))
    };
    for task in ["1", "2", "3"] {
        assert!(position(EventType::TaskAssigned, task) < position(EventType::RunnerStarted, task));
        assert!(
            position(EventType::RunnerStarted, task)
                < position(EventType::RunnerFinished, task)
        );
        assert!(
            position(EventType::RunnerFinished, task)
                <= position(EventType::TaskCompleted, task)
        );
    }
    assert!(position(EventType::TaskCompleted, "1") < position(EventType::TaskAssigned, "2"));
    assert!(position(EventType::TaskCompleted, "2") < position(EventType::TaskAssigned, "3"));
    // The unblock happens inside task 1's DONE transition, before dispatch
    // of task 2.
    assert!(position(EventType::RunnerFinished, "1") < position(EventType::TaskReady, "2"));
    assert!(position(EventType::TaskReady, "2") < position(EventType::TaskAssigned, "2"));
}

#[tokio::test]
#[serial]
async fn priority_overtake_dispatches_high_priority_first() {
    let fx = fixture(1, |_| {}).await;
    fx.registry
        .create_taskset(
            "prio",
            vec![
                TaskDefinition::new("A", "low priority").with_priority(1),
                TaskDefinition::new("B", "high priority").with_priority(10),
            ],
        )
        .unwrap();

    run_until(&fx, Duration::from_secs(30), |fx| {
        fx.registry.get_taskset("prio").unwrap().all_done()
    })
    .await;

    assert_eq!(fx.launcher.launch_order(), ["B", "A"]);
}

#[tokio::test]
#[serial]
async fn retry_then_success_clears_the_record() {
    let fx = fixture(1, |d| {
        d.retry_max_attempts = 3;
        d.retry_initial_delay_secs = 1;
    })
    .await;
    fx.registry
        .create_taskset("retry", vec![TaskDefinition::new("X", "flaky task")])
        .unwrap();
    fx.launcher.behave(
        "X",
        vec![
            Behavior::Fail(Duration::from_millis(20), "test_failed".into()),
            Behavior::Succeed(Duration::from_millis(20)),
        ],
    );

    run_until(&fx, Duration::from_secs(30), |fx| {
        fx.registry.get_taskset("retry").unwrap().all_done()
    })
    .await;

    assert_eq!(states(&fx, "retry")["X"], TaskState::Done);
    assert_eq!(fx.launcher.launch_order(), ["X", "X"]);

    let events = fx.registry.journal().read_all("retry").unwrap();
    let finished: Vec<bool> = events
        .iter()
        .filter(|e| e.event_type == EventType::RunnerFinished)
        .map(|e| e.details["success"].as_bool().unwrap())
        .collect();
    assert_eq!(finished, [false, true]);
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::TaskCompleted && e.task_id == "X"));
}

#[tokio::test]
#[serial]
async fn exhausted_retries_mark_task_failed_with_count() {
    let fx = fixture(1, |d| {
        d.retry_max_attempts = 2;
        d.retry_initial_delay_secs = 1;
    })
    .await;
    fx.registry
        .create_taskset("doomed", vec![TaskDefinition::new("X", "always fails")])
        .unwrap();
    fx.launcher.behave(
        "X",
        vec![
            Behavior::Fail(Duration::from_millis(20), "test_failed".into()),
            Behavior::Fail(Duration::from_millis(20), "test_failed".into()),
        ],
    );

    run_until(&fx, Duration::from_secs(30), |fx| {
        states(fx, "doomed")["X"] == TaskState::Failed
    })
    .await;

    assert_eq!(states(&fx, "doomed")["X"], TaskState::Failed);
    assert_eq!(fx.launcher.launch_order().len(), 2);

    let events = fx.registry.journal().read_all("doomed").unwrap();
    let failed = events
        .iter()
        .find(|e| e.event_type == EventType::TaskFailed)
        .expect("TaskFailed event");
    assert_eq!(failed.details["retry_count"], 2);
    assert_eq!(failed.details["failure_reason"], "test_failed");
}

#[tokio::test]
#[serial]
async fn heartbeat_timeout_reaps_hung_runner() {
    let fx = fixture(1, |d| {
        d.heartbeat_timeout_secs = 1;
        d.retry_max_attempts = 1;
    })
    .await;
    fx.registry
        .create_taskset("hung", vec![TaskDefinition::new("X", "wedged task")])
        .unwrap();
    fx.launcher.behave("X", vec![Behavior::Hang]);

    run_until(&fx, Duration::from_secs(30), |fx| {
        states(fx, "hung")["X"] == TaskState::Failed
    })
    .await;

    assert_eq!(states(&fx, "hung")["X"], TaskState::Failed);

    let events = fx.registry.journal().read_all("hung").unwrap();
    let finished = events
        .iter()
        .find(|e| e.event_type == EventType::RunnerFinished)
        .expect("RunnerFinished event");
    assert_eq!(finished.details["success"], false);
    assert_eq!(finished.details["failure_reason"], "heartbeat_timeout");

    // The slot came back (background cleanup may still be flushing).
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let record = fx.workspace.get_pool("local").unwrap();
        if record.slots[0].state == SlotState::Available {
            break;
        }
        assert!(Instant::now() < deadline, "slot never released");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
#[serial]
async fn graceful_shutdown_waits_for_in_flight_runner() {
    let fx = fixture(1, |_| {}).await;
    fx.registry
        .create_taskset("grace", vec![TaskDefinition::new("X", "slow task")])
        .unwrap();
    fx.launcher
        .behave("X", vec![Behavior::Succeed(Duration::from_secs(2))]);

    let dispatcher = Arc::clone(&fx.dispatcher);
    let handle = tokio::spawn(async move { dispatcher.run().await });

    // Wait for the runner to be in flight, then request shutdown.
    let deadline = Instant::now() + Duration::from_secs(15);
    while fx.dispatcher.running_count() == 0 {
        assert!(Instant::now() < deadline, "runner never started");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    fx.dispatcher.stop();
    handle.await.unwrap().unwrap();

    // The in-flight runner finished through the normal completion path.
    assert_eq!(states(&fx, "grace")["X"], TaskState::Done);
    assert_eq!(fx.dispatcher.running_count(), 0);
}

#[tokio::test]
#[serial]
async fn shutdown_with_no_runners_is_fast_and_stop_is_idempotent() {
    let fx = fixture(1, |_| {}).await;

    let dispatcher = Arc::clone(&fx.dispatcher);
    let handle = tokio::spawn(async move { dispatcher.run().await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    fx.dispatcher.stop();
    fx.dispatcher.stop();
    handle.await.unwrap().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    // Stop after exit is still a no-op.
    fx.dispatcher.stop();
}

#[tokio::test]
#[serial]
async fn metrics_snapshot_reflects_completions() {
    let fx = fixture(2, |_| {}).await;
    fx.registry
        .create_taskset(
            "metrics",
            vec![
                TaskDefinition::new("1", "one"),
                TaskDefinition::new("2", "two"),
            ],
        )
        .unwrap();

    run_until(&fx, Duration::from_secs(30), |fx| {
        fx.registry.get_taskset("metrics").unwrap().all_done()
    })
    .await;

    let text = fx.dispatcher.metrics_text();
    assert!(text.contains("necrocode_tasks_completed_total 2"), "{text}");
    assert!(text.contains("necrocode_pool_running{pool=\"local\"} 0"));
    assert!(text.contains("necrocode_running_total 0"));
}
