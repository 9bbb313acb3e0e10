//! NecroCode Configuration Module
//!
//! One TOML document covers the dispatcher, agent pools, skill mapping,
//! workspace pool, registry, and runner sections. Env vars override
//! credentials at load time.
//!
//! ## Priority Order (highest to lowest)
//!
//! 1. Environment variables (`NECROCODE_CODEGEN_TOKEN`, `NECROCODE_GIT_TOKEN`)
//! 2. Config file (`necrocode.toml`, or `~/.config/necrocode/config.toml`)
//! 3. Defaults

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NecroError, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NecroConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Dispatcher-side execution environments
    #[serde(default)]
    pub agent_pools: Vec<AgentPoolConfig>,

    /// skill -> ordered pool names; must contain a "default" entry
    #[serde(default)]
    pub skills: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub workspace: WorkspaceConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub credentials: Credentials,
}

/// Scheduling policy for pool assignment
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    Fifo,
    Priority,
    #[default]
    SkillBased,
    FairShare,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    pub poll_interval_secs: u64,
    pub scheduling_policy: SchedulingPolicy,
    pub max_global_concurrency: usize,
    pub retry_max_attempts: u32,
    pub retry_backoff_base: f64,
    pub retry_initial_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub graceful_shutdown_timeout_secs: u64,
    /// Deadlock scan cadence, measured in main-loop ticks
    pub deadlock_detection_interval_ticks: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            scheduling_policy: SchedulingPolicy::SkillBased,
            max_global_concurrency: 8,
            retry_max_attempts: 3,
            retry_backoff_base: 2.0,
            retry_initial_delay_secs: 1,
            retry_max_delay_secs: 300,
            heartbeat_timeout_secs: 60,
            graceful_shutdown_timeout_secs: 300,
            deadlock_detection_interval_ticks: 60,
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }
}

/// Execution environment kind for an agent pool
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentPoolKind {
    #[default]
    LocalProcess,
    Docker,
    Kubernetes,
}

impl std::fmt::Display for AgentPoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalProcess => write!(f, "local_process"),
            Self::Docker => write!(f, "docker"),
            Self::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentPoolConfig {
    pub name: String,
    #[serde(default)]
    pub kind: AgentPoolKind,
    #[serde(default = "default_pool_concurrency")]
    pub max_concurrency: usize,
    /// Advisory CPU cap (cores). Enforced as cgroup limits for docker/k8s.
    #[serde(default)]
    pub cpu_quota: Option<f64>,
    /// Advisory memory cap in MB. Enforced as cgroup limits for docker/k8s.
    #[serde(default)]
    pub memory_quota_mb: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Mode-specific settings (image, namespace, service account, ...)
    #[serde(default)]
    pub type_specific: HashMap<String, String>,
}

fn default_pool_concurrency() -> usize {
    4
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub base_path: PathBuf,
    pub num_slots_per_pool: usize,
    pub cleanup_timeout_secs: u64,
    pub allocation_lock_timeout_ms: u64,
    pub background_cleanup_workers: usize,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from(".necrocode/workspaces"),
            num_slots_per_pool: 4,
            cleanup_timeout_secs: 120,
            allocation_lock_timeout_ms: 2_000,
            background_cleanup_workers: 2,
        }
    }
}

impl WorkspaceConfig {
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }

    pub fn allocation_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.allocation_lock_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    pub base_path: PathBuf,
    pub lock_timeout_ms: u64,
    pub lock_retry_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from(".necrocode/registry"),
            lock_timeout_ms: 5_000,
            lock_retry_interval_ms: 50,
        }
    }
}

impl RegistryConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    pub default_task_timeout_secs: u64,
    pub max_memory_mb: Option<u64>,
    pub max_cpu_percent: Option<f64>,
    pub mask_secrets: bool,
    pub persist_state: bool,
    /// Project-default test command used when a task carries none
    pub default_test_command: Option<String>,
    /// Extra credential patterns the masker applies on top of the built-ins
    pub extra_secret_patterns: Vec<String>,
    /// Code-generation endpoint; the runner fails fast without it unless a
    /// mock generator is injected
    pub codegen_endpoint: Option<String>,
    pub codegen_rate_per_second: f64,
    pub codegen_burst: u32,
    /// Local directory artifact store root
    pub artifact_store_path: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_task_timeout_secs: 30 * 60,
            max_memory_mb: None,
            max_cpu_percent: None,
            mask_secrets: true,
            persist_state: false,
            default_test_command: None,
            extra_secret_patterns: Vec::new(),
            codegen_endpoint: None,
            codegen_rate_per_second: 2.0,
            codegen_burst: 4,
            artifact_store_path: PathBuf::from(".necrocode/artifacts"),
        }
    }
}

impl RunnerConfig {
    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }
}

/// Credentials live in process memory only; they are read from the
/// environment or the config file at startup and cleared on runner exit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    /// Token for the code-generation service
    pub codegen_token: Option<String>,
    /// Git token used for pushes
    pub git_token: Option<String>,
    /// Optional artifact-store credential
    pub artifact_token: Option<String>,
}

impl Credentials {
    /// Zero out all credential material
    pub fn clear(&mut self) {
        self.codegen_token = None;
        self.git_token = None;
        self.artifact_token = None;
    }
}

impl NecroConfig {
    /// Default config location: `~/.config/necrocode/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("necrocode")
            .join("config.toml")
    }

    /// Load configuration from a file, or defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| NecroError::ConfigError {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;

        toml::from_str(&content).map_err(|e| NecroError::ConfigError {
            reason: format!("failed to parse {}: {}", path.display(), e),
        })
    }

    /// Save configuration, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| NecroError::ConfigError {
                reason: format!("failed to create {}: {}", dir.display(), e),
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| NecroError::ConfigError {
            reason: format!("failed to serialize config: {}", e),
        })?;

        fs::write(path, content).map_err(|e| NecroError::ConfigError {
            reason: format!("failed to write {}: {}", path.display(), e),
        })?;

        Ok(())
    }

    /// Merge environment variables over file values.
    pub fn with_env(mut self) -> Self {
        if let Ok(token) = std::env::var("NECROCODE_CODEGEN_TOKEN") {
            if !token.is_empty() {
                self.credentials.codegen_token = Some(token);
            }
        }
        if let Ok(token) = std::env::var("NECROCODE_GIT_TOKEN") {
            if !token.is_empty() {
                self.credentials.git_token = Some(token);
            }
        }
        if let Ok(token) = std::env::var("NECROCODE_ARTIFACT_TOKEN") {
            if !token.is_empty() {
                self.credentials.artifact_token = Some(token);
            }
        }
        self
    }

    /// Validate cross-field constraints before the dispatcher starts.
    pub fn validate(&self) -> Result<()> {
        if !self.skills.is_empty() && !self.skills.contains_key("default") {
            return Err(NecroError::InvalidConfig {
                reason: "skill mapping must contain a 'default' entry".to_string(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for pool in &self.agent_pools {
            if pool.name.is_empty() {
                return Err(NecroError::InvalidConfig {
                    reason: "agent pool with empty name".to_string(),
                });
            }
            if !seen.insert(pool.name.as_str()) {
                return Err(NecroError::InvalidConfig {
                    reason: format!("duplicate agent pool name '{}'", pool.name),
                });
            }
            if pool.max_concurrency == 0 {
                return Err(NecroError::InvalidConfig {
                    reason: format!("agent pool '{}' has max_concurrency 0", pool.name),
                });
            }
        }

        for (skill, pools) in &self.skills {
            for name in pools {
                if !seen.contains(name.as_str()) {
                    return Err(NecroError::InvalidConfig {
                        reason: format!("skill '{}' maps to unknown pool '{}'", skill, name),
                    });
                }
            }
        }

        if self.dispatcher.max_global_concurrency == 0 {
            return Err(NecroError::InvalidConfig {
                reason: "max_global_concurrency must be at least 1".to_string(),
            });
        }
        if self.dispatcher.retry_backoff_base < 1.0 {
            return Err(NecroError::InvalidConfig {
                reason: "retry_backoff_base must be >= 1.0".to_string(),
            });
        }
        if self.workspace.num_slots_per_pool == 0 {
            return Err(NecroError::InvalidConfig {
                reason: "num_slots_per_pool must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Candidate pools for a skill, falling back to the `default` entry.
    pub fn pools_for_skill(&self, skill: &str) -> Option<&[String]> {
        self.skills
            .get(skill)
            .or_else(|| self.skills.get("default"))
            .map(|v| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pool(name: &str) -> AgentPoolConfig {
        AgentPoolConfig {
            name: name.to_string(),
            kind: AgentPoolKind::LocalProcess,
            max_concurrency: 2,
            cpu_quota: None,
            memory_quota_mb: None,
            enabled: true,
            type_specific: HashMap::new(),
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = DispatcherConfig::default();
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.retry_max_attempts, 3);
        assert!((config.retry_backoff_base - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.retry_initial_delay_secs, 1);
        assert_eq!(config.retry_max_delay_secs, 300);
        assert_eq!(config.graceful_shutdown_timeout_secs, 300);

        let runner = RunnerConfig::default();
        assert_eq!(runner.default_task_timeout_secs, 30 * 60);
        assert!(runner.mask_secrets);
    }

    #[test]
    fn roundtrip_through_toml() {
        let mut config = NecroConfig::default();
        config.agent_pools.push(pool("local"));
        config
            .skills
            .insert("default".to_string(), vec!["local".to_string()]);

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: NecroConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NecroConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, NecroConfig::default());
    }

    #[test]
    fn validate_requires_default_skill() {
        let mut config = NecroConfig::default();
        config.agent_pools.push(pool("local"));
        config
            .skills
            .insert("backend".to_string(), vec!["local".to_string()]);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("default"));
    }

    #[test]
    fn validate_rejects_duplicate_pool_names() {
        let mut config = NecroConfig::default();
        config.agent_pools.push(pool("local"));
        config.agent_pools.push(pool("local"));

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn validate_rejects_unknown_pool_in_skill_map() {
        let mut config = NecroConfig::default();
        config.agent_pools.push(pool("local"));
        config
            .skills
            .insert("default".to_string(), vec!["ghost".to_string()]);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn pools_for_skill_falls_back_to_default() {
        let mut config = NecroConfig::default();
        config.agent_pools.push(pool("local"));
        config
            .skills
            .insert("default".to_string(), vec!["local".to_string()]);

        let pools = config.pools_for_skill("frontend").unwrap();
        assert_eq!(pools, ["local".to_string()]);
    }

    #[test]
    fn credentials_clear_zeroes_everything() {
        let mut creds = Credentials {
            codegen_token: Some("sk-test".into()),
            git_token: Some("ghp_test".into()),
            artifact_token: None,
        };
        creds.clear();
        assert!(creds.codegen_token.is_none());
        assert!(creds.git_token.is_none());
    }
}
