//! Runner launching in three modes
//!
//! - LOCAL_PROCESS: subprocess of this binary (`necrocode runner`) with a
//!   scoped environment.
//! - DOCKER: `docker run` with a workspace bind-mount and cgroup limits.
//! - KUBERNETES: a Job manifest with resources, secret env, service account,
//!   and image-pull policy.
//!
//! Every launch gets a DNS-1123 compliant runner id and a watcher task that
//! heartbeats the monitor while the runner is alive and delivers a
//! `CompletionReport` when it exits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::config::{AgentPoolConfig, AgentPoolKind, Credentials};
use crate::error::{NecroError, Result};
use crate::runner::context::{RunnerContext, CONTEXT_ENV_VAR};

use super::monitor::RunnerMonitor;

const WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Everything needed to start one runner
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub ctx: RunnerContext,
    pub pool: AgentPoolConfig,
    pub credentials: Credentials,
}

/// Pool-appropriate handle for force-termination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerHandle {
    Pid(u32),
    Container(String),
    Job(String),
}

#[derive(Debug, Clone)]
pub struct LaunchedRunner {
    pub runner_id: String,
    pub pool_name: String,
    pub handle: RunnerHandle,
}

/// Delivered on the completion channel when a runner exits
#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub runner_id: String,
    pub spec: String,
    pub task_id: String,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub execution_time_seconds: f64,
}

/// Launch seam; the dispatcher only sees this trait.
#[async_trait]
pub trait RunnerLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<LaunchedRunner>;
    async fn terminate(&self, runner: &LaunchedRunner) -> Result<()>;
}

static DNS1123: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("dns1123 regex"));

/// `runner-<12 hex>` — valid as a pod/Job name fragment.
pub fn generate_runner_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("runner-{}", &id[..12])
}

pub fn is_dns1123_label(label: &str) -> bool {
    DNS1123.is_match(label)
}

/// Concrete launcher covering all three pool kinds
pub struct DefaultLauncher {
    completion_tx: UnboundedSender<CompletionReport>,
    monitor: Arc<RunnerMonitor>,
    contexts_dir: PathBuf,
    children: Arc<DashMap<String, Arc<tokio::sync::Mutex<Child>>>>,
}

impl DefaultLauncher {
    pub fn new(
        completion_tx: UnboundedSender<CompletionReport>,
        monitor: Arc<RunnerMonitor>,
        contexts_dir: PathBuf,
    ) -> Self {
        Self {
            completion_tx,
            monitor,
            contexts_dir,
            children: Arc::new(DashMap::new()),
        }
    }

    fn report(
        tx: &UnboundedSender<CompletionReport>,
        spec: &LaunchSpec,
        started: Instant,
        success: bool,
        failure_reason: Option<String>,
    ) {
        let _ = tx.send(CompletionReport {
            runner_id: spec.ctx.runner_id.clone(),
            spec: spec.ctx.spec_name.clone(),
            task_id: spec.ctx.task_id.clone(),
            success,
            failure_reason,
            execution_time_seconds: started.elapsed().as_secs_f64(),
        });
    }

    // ═══════════════════════════════════════════════════════════════
    // LOCAL_PROCESS
    // ═══════════════════════════════════════════════════════════════

    async fn launch_local(&self, spec: LaunchSpec) -> Result<LaunchedRunner> {
        let context_path = spec.ctx.write_to(&self.contexts_dir)?;

        let mut command = match spec.pool.type_specific.get("command") {
            // Override hook for operators (and tests): run through sh -c.
            Some(custom) => {
                let mut c = Command::new("sh");
                c.arg("-c").arg(custom);
                c
            }
            None => {
                let exe = std::env::current_exe().map_err(|e| NecroError::LaunchFailed {
                    pool: spec.pool.name.clone(),
                    reason: format!("current_exe: {e}"),
                })?;
                let mut c = Command::new(exe);
                c.arg("runner");
                c
            }
        };

        command
            .env(CONTEXT_ENV_VAR, &context_path)
            .current_dir(&spec.ctx.slot_path)
            .kill_on_drop(true);
        apply_credential_env(&mut command, &spec.credentials);

        let child = command.spawn().map_err(|e| NecroError::LaunchFailed {
            pool: spec.pool.name.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id().unwrap_or(0);

        let child = Arc::new(tokio::sync::Mutex::new(child));
        self.children
            .insert(spec.ctx.runner_id.clone(), Arc::clone(&child));

        let runner = LaunchedRunner {
            runner_id: spec.ctx.runner_id.clone(),
            pool_name: spec.pool.name.clone(),
            handle: RunnerHandle::Pid(pid),
        };

        // Watcher: poll for exit, heartbeat while alive.
        let tx = self.completion_tx.clone();
        let monitor = Arc::clone(&self.monitor);
        let children = Arc::clone(&self.children);
        tokio::spawn(async move {
            let started = Instant::now();
            loop {
                tokio::time::sleep(WATCH_INTERVAL).await;
                let status = child.lock().await.try_wait();
                match status {
                    Ok(Some(status)) => {
                        children.remove(&spec.ctx.runner_id);
                        let success = status.success();
                        let reason = (!success)
                            .then(|| format!("runner exited with {}", status.code().unwrap_or(-1)));
                        Self::report(&tx, &spec, started, success, reason);
                        return;
                    }
                    Ok(None) => monitor.heartbeat(&spec.ctx.runner_id),
                    Err(e) => {
                        children.remove(&spec.ctx.runner_id);
                        Self::report(&tx, &spec, started, false, Some(format!("wait failed: {e}")));
                        return;
                    }
                }
            }
        });

        Ok(runner)
    }

    // ═══════════════════════════════════════════════════════════════
    // DOCKER
    // ═══════════════════════════════════════════════════════════════

    async fn launch_docker(&self, spec: LaunchSpec) -> Result<LaunchedRunner> {
        let image = spec
            .pool
            .type_specific
            .get("image")
            .cloned()
            .unwrap_or_else(|| "necrocode-runner:latest".to_string());
        let context_path = spec.ctx.write_to(&self.contexts_dir)?;

        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--name".into(),
            spec.ctx.runner_id.clone(),
            "--volume".into(),
            format!("{}:/workspace", spec.ctx.slot_path.display()),
            "--volume".into(),
            format!("{}:/necrocode/context.json:ro", context_path.display()),
            "--env".into(),
            format!("{CONTEXT_ENV_VAR}=/necrocode/context.json"),
        ];
        for (key, value) in credential_env(&spec.credentials) {
            args.push("--env".into());
            args.push(format!("{key}={value}"));
        }
        if let Some(mb) = spec.pool.memory_quota_mb {
            args.push("--memory".into());
            args.push(format!("{mb}m"));
        }
        if let Some(cpus) = spec.pool.cpu_quota {
            args.push("--cpus".into());
            args.push(format!("{cpus}"));
        }
        args.push(image);

        let output = run_cli("docker", &args, &spec.pool.name).await?;
        let container_id = output.trim().to_string();

        let runner = LaunchedRunner {
            runner_id: spec.ctx.runner_id.clone(),
            pool_name: spec.pool.name.clone(),
            handle: RunnerHandle::Container(container_id.clone()),
        };

        let tx = self.completion_tx.clone();
        let monitor = Arc::clone(&self.monitor);
        tokio::spawn(async move {
            let started = Instant::now();
            loop {
                tokio::time::sleep(WATCH_INTERVAL).await;
                let inspect = run_cli(
                    "docker",
                    &[
                        "inspect".into(),
                        "-f".into(),
                        "{{.State.Status}} {{.State.ExitCode}}".into(),
                        container_id.clone(),
                    ],
                    &spec.pool.name,
                )
                .await;
                match inspect {
                    Ok(out) => {
                        let mut parts = out.trim().split_whitespace();
                        let status = parts.next().unwrap_or("");
                        let exit_code: i32 = parts.next().and_then(|c| c.parse().ok()).unwrap_or(-1);
                        if status == "exited" || status == "dead" {
                            let success = exit_code == 0;
                            let reason = (!success)
                                .then(|| format!("container exited with {exit_code}"));
                            Self::report(&tx, &spec, started, success, reason);
                            return;
                        }
                        monitor.heartbeat(&spec.ctx.runner_id);
                    }
                    Err(e) => {
                        Self::report(&tx, &spec, started, false, Some(e.to_string()));
                        return;
                    }
                }
            }
        });

        Ok(runner)
    }

    // ═══════════════════════════════════════════════════════════════
    // KUBERNETES
    // ═══════════════════════════════════════════════════════════════

    fn job_manifest(spec: &LaunchSpec) -> serde_json::Value {
        let ts = &spec.pool.type_specific;
        let image = ts
            .get("image")
            .cloned()
            .unwrap_or_else(|| "necrocode-runner:latest".to_string());
        let namespace = ts.get("namespace").cloned().unwrap_or_else(|| "default".into());

        let mut resources = serde_json::Map::new();
        if let Some(cpus) = spec.pool.cpu_quota {
            resources.insert("cpu".into(), json!(format!("{cpus}")));
        }
        if let Some(mb) = spec.pool.memory_quota_mb {
            resources.insert("memory".into(), json!(format!("{mb}Mi")));
        }

        let mut env = vec![json!({"name": CONTEXT_ENV_VAR, "value": "/necrocode/context.json"})];
        if let Some(secret) = ts.get("secret_name") {
            env.push(json!({
                "name": "NECROCODE_CODEGEN_TOKEN",
                "valueFrom": {"secretKeyRef": {"name": secret, "key": "codegen-token"}}
            }));
            env.push(json!({
                "name": "NECROCODE_GIT_TOKEN",
                "valueFrom": {"secretKeyRef": {"name": secret, "key": "git-token"}}
            }));
        }

        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": spec.ctx.runner_id,
                "namespace": namespace,
                "labels": {"app": "necrocode-runner", "necrocode/task": spec.ctx.task_id}
            },
            "spec": {
                "backoffLimit": 0,
                "template": {
                    "spec": {
                        "restartPolicy": "Never",
                        "serviceAccountName": ts.get("service_account").cloned().unwrap_or_else(|| "default".into()),
                        "containers": [{
                            "name": "runner",
                            "image": image,
                            "imagePullPolicy": ts.get("image_pull_policy").cloned().unwrap_or_else(|| "IfNotPresent".into()),
                            "env": env,
                            "resources": {"limits": resources},
                            "volumeMounts": [{"name": "workspace", "mountPath": "/workspace"}]
                        }],
                        "volumes": [{
                            "name": "workspace",
                            "hostPath": {"path": spec.ctx.slot_path.display().to_string()}
                        }]
                    }
                }
            }
        })
    }

    async fn launch_kubernetes(&self, spec: LaunchSpec) -> Result<LaunchedRunner> {
        let manifest = Self::job_manifest(&spec);
        let manifest_path = self
            .contexts_dir
            .join(format!("{}.job.json", spec.ctx.runner_id));
        std::fs::create_dir_all(&self.contexts_dir)?;
        std::fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)?;

        run_cli(
            "kubectl",
            &["apply".into(), "-f".into(), manifest_path.display().to_string()],
            &spec.pool.name,
        )
        .await?;

        let job_name = spec.ctx.runner_id.clone();
        let runner = LaunchedRunner {
            runner_id: spec.ctx.runner_id.clone(),
            pool_name: spec.pool.name.clone(),
            handle: RunnerHandle::Job(job_name.clone()),
        };

        let tx = self.completion_tx.clone();
        let monitor = Arc::clone(&self.monitor);
        tokio::spawn(async move {
            let started = Instant::now();
            loop {
                tokio::time::sleep(WATCH_INTERVAL * 2).await;
                let status = run_cli(
                    "kubectl",
                    &[
                        "get".into(),
                        "job".into(),
                        job_name.clone(),
                        "-o".into(),
                        "jsonpath={.status.succeeded},{.status.failed}".into(),
                    ],
                    &spec.pool.name,
                )
                .await;
                match status {
                    Ok(out) => {
                        let mut parts = out.trim().split(',');
                        let succeeded: u32 =
                            parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                        let failed: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                        if succeeded > 0 {
                            Self::report(&tx, &spec, started, true, None);
                            return;
                        }
                        if failed > 0 {
                            Self::report(&tx, &spec, started, false, Some("job failed".into()));
                            return;
                        }
                        monitor.heartbeat(&spec.ctx.runner_id);
                    }
                    Err(e) => {
                        Self::report(&tx, &spec, started, false, Some(e.to_string()));
                        return;
                    }
                }
            }
        });

        Ok(runner)
    }
}

#[async_trait]
impl RunnerLauncher for DefaultLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<LaunchedRunner> {
        debug_assert!(is_dns1123_label(&spec.ctx.runner_id));
        info!(
            runner_id = %spec.ctx.runner_id,
            pool = %spec.pool.name,
            kind = %spec.pool.kind,
            task = %spec.ctx.task_id,
            "launching runner"
        );
        match spec.pool.kind {
            AgentPoolKind::LocalProcess => self.launch_local(spec).await,
            AgentPoolKind::Docker => self.launch_docker(spec).await,
            AgentPoolKind::Kubernetes => self.launch_kubernetes(spec).await,
        }
    }

    async fn terminate(&self, runner: &LaunchedRunner) -> Result<()> {
        warn!(runner_id = %runner.runner_id, handle = ?runner.handle, "force-terminating runner");
        match &runner.handle {
            RunnerHandle::Pid(_) => {
                if let Some((_, child)) = self.children.remove(&runner.runner_id) {
                    let mut child = child.lock().await;
                    child.start_kill().map_err(|e| NecroError::LaunchFailed {
                        pool: runner.pool_name.clone(),
                        reason: format!("kill: {e}"),
                    })?;
                }
                Ok(())
            }
            RunnerHandle::Container(id) => {
                run_cli(
                    "docker",
                    &["stop".into(), "--time".into(), "5".into(), id.clone()],
                    &runner.pool_name,
                )
                .await
                .map(|_| ())
            }
            RunnerHandle::Job(name) => run_cli(
                "kubectl",
                &[
                    "delete".into(),
                    "job".into(),
                    name.clone(),
                    "--ignore-not-found".into(),
                ],
                &runner.pool_name,
            )
            .await
            .map(|_| ()),
        }
    }
}

fn credential_env(credentials: &Credentials) -> Vec<(&'static str, String)> {
    let mut env = Vec::new();
    if let Some(token) = &credentials.codegen_token {
        env.push(("NECROCODE_CODEGEN_TOKEN", token.clone()));
    }
    if let Some(token) = &credentials.git_token {
        env.push(("NECROCODE_GIT_TOKEN", token.clone()));
    }
    if let Some(token) = &credentials.artifact_token {
        env.push(("NECROCODE_ARTIFACT_TOKEN", token.clone()));
    }
    env
}

fn apply_credential_env(command: &mut Command, credentials: &Credentials) {
    for (key, value) in credential_env(credentials) {
        command.env(key, value);
    }
}

async fn run_cli(program: &str, args: &[String], pool: &str) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| NecroError::LaunchFailed {
            pool: pool.to_string(),
            reason: format!("{program}: {e}"),
        })?;
    if !output.status.success() {
        return Err(NecroError::LaunchFailed {
            pool: pool.to_string(),
            reason: format!(
                "{program} {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
