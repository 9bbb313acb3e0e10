//! NecroCode Error Types with Error Codes
//!
//! Error code ranges:
//! - NECRO-000-009: Configuration errors
//! - NECRO-010-019: Task registry errors
//! - NECRO-020-029: Event journal errors
//! - NECRO-030-039: Workspace pool errors
//! - NECRO-040-049: Git errors
//! - NECRO-050-059: Dispatcher errors
//! - NECRO-060-069: Runner errors
//! - NECRO-070-079: Artifact errors
//! - NECRO-080-089: Coordinator/permission errors
//! - NECRO-090-099: IO/serialization errors

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NecroError>;

#[derive(Error, Debug, Diagnostic)]
#[diagnostic(url(docsrs))]
pub enum NecroError {
    // ═══════════════════════════════════════════
    // CONFIG ERRORS (000-009)
    // ═══════════════════════════════════════════
    #[error("[NECRO-001] Config error: {reason}")]
    #[diagnostic(code(necrocode::config), help("Check the config TOML for syntax errors"))]
    ConfigError { reason: String },

    #[error("[NECRO-002] Invalid configuration: {reason}")]
    #[diagnostic(
        code(necrocode::invalid_config),
        help("Skill mapping needs a 'default' entry and pool names must be unique")
    )]
    InvalidConfig { reason: String },

    // ═══════════════════════════════════════════
    // REGISTRY ERRORS (010-019)
    // ═══════════════════════════════════════════
    #[error("[NECRO-010] Taskset '{spec}' already exists")]
    #[diagnostic(code(necrocode::taskset_exists))]
    TasksetExists { spec: String },

    #[error("[NECRO-011] Taskset '{spec}' not found")]
    #[diagnostic(code(necrocode::taskset_not_found), help("Create the taskset first"))]
    TasksetNotFound { spec: String },

    #[error("[NECRO-012] Task '{task_id}' not found in spec '{spec}'")]
    TaskNotFound { spec: String, task_id: String },

    #[error("[NECRO-013] Invalid transition for task '{task_id}': {from} -> {to}")]
    #[diagnostic(
        code(necrocode::invalid_transition),
        help("Valid: READY->RUNNING|BLOCKED, BLOCKED->READY, RUNNING->DONE|FAILED|READY, FAILED->READY|RUNNING, DONE->READY")
    )]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("[NECRO-014] Circular dependency detected: {}", cycle.join(" -> "))]
    #[diagnostic(
        code(necrocode::circular_dependency),
        help("Remove one edge of the cycle from the task definitions")
    )]
    CircularDependency { cycle: Vec<String> },

    #[error("[NECRO-015] Task '{task_id}' depends on unknown task '{dep_id}'")]
    MissingDependency { task_id: String, dep_id: String },

    #[error("[NECRO-016] Registry lock for '{spec}' unavailable after {attempts} attempts: {reason}")]
    #[diagnostic(
        code(necrocode::transient_registry),
        help("Another writer is holding the spec lock; the operation can be retried")
    )]
    TransientRegistry {
        spec: String,
        attempts: u32,
        reason: String,
    },

    #[error("[NECRO-017] Transition to RUNNING for '{task_id}' requires assignment metadata ({missing})")]
    MissingAssignment { task_id: String, missing: String },

    // ═══════════════════════════════════════════
    // EVENT JOURNAL ERRORS (020-029)
    // ═══════════════════════════════════════════
    #[error("[NECRO-020] Event journal write failed for '{spec}': {reason}")]
    JournalWrite { spec: String, reason: String },

    #[error("[NECRO-021] Fallback journal write failed for '{spec}': {reason}")]
    #[diagnostic(
        code(necrocode::fallback_journal),
        help("Both the journal and its fallback are unwritable; check registry permissions")
    )]
    FallbackJournalWrite { spec: String, reason: String },

    // ═══════════════════════════════════════════
    // WORKSPACE POOL ERRORS (030-039)
    // ═══════════════════════════════════════════
    #[error("[NECRO-030] Workspace pool '{pool}' not found")]
    PoolNotFound { pool: String },

    #[error("[NECRO-031] No slots available in pool '{pool}'")]
    #[diagnostic(
        code(necrocode::no_slots),
        help("All slots are allocated or in ERROR state; the task will be re-queued")
    )]
    NoSlotsAvailable { pool: String },

    #[error("[NECRO-032] Slot '{slot_id}' not found")]
    SlotNotFound { slot_id: String },

    #[error("[NECRO-033] Lock on slot '{slot_id}' not acquired within {timeout_ms}ms")]
    SlotLockTimeout { slot_id: String, timeout_ms: u64 },

    #[error("[NECRO-034] Slot '{slot_id}' cleanup failed: {reason}")]
    #[diagnostic(
        code(necrocode::slot_cleanup),
        help("The slot is marked ERROR and excluded from allocation until repaired")
    )]
    SlotCleanupFailed { slot_id: String, reason: String },

    #[error("[NECRO-035] Slot '{slot_id}' is held by '{holder}', not '{caller}'")]
    SlotNotHeld {
        slot_id: String,
        holder: String,
        caller: String,
    },

    #[error("[NECRO-036] Slot '{slot_id}' is allocated; pass force to remove it")]
    SlotAllocated { slot_id: String },

    #[error("[NECRO-037] Pool '{pool}' already exists at {path}")]
    PoolExists { pool: String, path: String },

    // ═══════════════════════════════════════════
    // GIT ERRORS (040-049)
    // ═══════════════════════════════════════════
    #[error("[NECRO-040] git {command} failed (exit {code}): {stderr}")]
    GitCommand {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("[NECRO-041] git {command} timed out after {timeout_secs}s")]
    GitTimeout { command: String, timeout_secs: u64 },

    #[error("[NECRO-042] Clone of '{repo_url}' failed: {reason}")]
    CloneFailed { repo_url: String, reason: String },

    #[error("[NECRO-043] Push of branch '{branch}' rejected: {reason}")]
    #[diagnostic(
        code(necrocode::push_rejected),
        help("Non-fast-forward or permission failure; the task fails without retry")
    )]
    PushRejected { branch: String, reason: String },

    #[error("[NECRO-044] Branch '{branch}' is already in use by '{owner}'")]
    BranchInUse { branch: String, owner: String },

    // ═══════════════════════════════════════════
    // DISPATCHER ERRORS (050-059)
    // ═══════════════════════════════════════════
    #[error("[NECRO-050] Runner launch failed in pool '{pool}': {reason}")]
    LaunchFailed { pool: String, reason: String },

    #[error("[NECRO-051] No agent pool accepts skill '{skill}'")]
    #[diagnostic(
        code(necrocode::no_pool_for_skill),
        help("Add the skill to the skill mapping or define a 'default' entry")
    )]
    NoPoolForSkill { skill: String },

    #[error("[NECRO-052] Agent pool '{pool}' not registered")]
    AgentPoolNotFound { pool: String },

    #[error("[NECRO-053] Dispatcher is shutting down; no new work accepted")]
    ShuttingDown,

    #[error("[NECRO-054] Graceful shutdown exceeded {timeout_secs}s; {remaining} runners force-terminated")]
    ShutdownTimeout { timeout_secs: u64, remaining: usize },

    // ═══════════════════════════════════════════
    // RUNNER ERRORS (060-069)
    // ═══════════════════════════════════════════
    #[error("[NECRO-060] Runner context invalid: {reason}")]
    #[diagnostic(code(necrocode::context_invalid), help("All required context fields must be present"))]
    ContextInvalid { reason: String },

    #[error("[NECRO-061] Code generation failed (transient, {attempts} attempts): {reason}")]
    CodegenTransient { attempts: u32, reason: String },

    #[error("[NECRO-062] Code generation failed (permanent): {reason}")]
    #[diagnostic(
        code(necrocode::codegen_permanent),
        help("Authentication or malformed-output failures are not retried")
    )]
    CodegenPermanent { reason: String },

    #[error("[NECRO-063] Tests failed: {failed} of {total} ({details})")]
    TestsFailed {
        total: u32,
        failed: u32,
        details: String,
    },

    #[error("[NECRO-064] Task '{task_id}' exceeded its {timeout_secs}s timeout during {phase}")]
    TaskTimeout {
        task_id: String,
        phase: String,
        timeout_secs: u64,
    },

    #[error("[NECRO-065] Resource limit breached: {resource} at {observed} (limit {limit})")]
    ResourceBreach {
        resource: String,
        observed: String,
        limit: String,
    },

    #[error("[NECRO-066] Runner state transition {from} -> {to} is not valid")]
    RunnerStateInvalid { from: String, to: String },

    #[error("[NECRO-067] Test command timed out after {timeout_secs}s")]
    TestTimeout { timeout_secs: u64 },

    // ═══════════════════════════════════════════
    // ARTIFACT ERRORS (070-079)
    // ═══════════════════════════════════════════
    #[error("[NECRO-070] Artifact upload failed ({kind}): {reason}")]
    ArtifactUpload { kind: String, reason: String },

    // ═══════════════════════════════════════════
    // COORDINATOR / PERMISSION ERRORS (080-089)
    // ═══════════════════════════════════════════
    #[error("[NECRO-080] Resource conflict: {resource} already registered to runner '{owner}'")]
    ResourceConflict { resource: String, owner: String },

    #[error("[NECRO-081] Path '{path}' is outside the allocated workspace")]
    #[diagnostic(
        code(necrocode::path_escape),
        help("Runners may only touch files under their slot directory")
    )]
    PathOutsideWorkspace { path: String },

    #[error("[NECRO-082] Direct access to .git internals is not permitted: {path}")]
    GitInternalsAccess { path: String },

    #[error("[NECRO-083] Refusing to push to '{branch}': runner owns '{feature_branch}'")]
    ForeignBranchPush {
        branch: String,
        feature_branch: String,
    },

    #[error("[NECRO-084] Dangerous shell pattern rejected: {pattern}")]
    DangerousCommand { pattern: String },

    // ═══════════════════════════════════════════
    // IO / SERIALIZATION ERRORS (090-099)
    // ═══════════════════════════════════════════
    #[error("[NECRO-093] IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[NECRO-094] JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NecroError {
    /// Get the stable error code (e.g., "NECRO-014")
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError { .. } => "NECRO-001",
            Self::InvalidConfig { .. } => "NECRO-002",
            Self::TasksetExists { .. } => "NECRO-010",
            Self::TasksetNotFound { .. } => "NECRO-011",
            Self::TaskNotFound { .. } => "NECRO-012",
            Self::InvalidTransition { .. } => "NECRO-013",
            Self::CircularDependency { .. } => "NECRO-014",
            Self::MissingDependency { .. } => "NECRO-015",
            Self::TransientRegistry { .. } => "NECRO-016",
            Self::MissingAssignment { .. } => "NECRO-017",
            Self::JournalWrite { .. } => "NECRO-020",
            Self::FallbackJournalWrite { .. } => "NECRO-021",
            Self::PoolNotFound { .. } => "NECRO-030",
            Self::NoSlotsAvailable { .. } => "NECRO-031",
            Self::SlotNotFound { .. } => "NECRO-032",
            Self::SlotLockTimeout { .. } => "NECRO-033",
            Self::SlotCleanupFailed { .. } => "NECRO-034",
            Self::SlotNotHeld { .. } => "NECRO-035",
            Self::SlotAllocated { .. } => "NECRO-036",
            Self::PoolExists { .. } => "NECRO-037",
            Self::GitCommand { .. } => "NECRO-040",
            Self::GitTimeout { .. } => "NECRO-041",
            Self::CloneFailed { .. } => "NECRO-042",
            Self::PushRejected { .. } => "NECRO-043",
            Self::BranchInUse { .. } => "NECRO-044",
            Self::LaunchFailed { .. } => "NECRO-050",
            Self::NoPoolForSkill { .. } => "NECRO-051",
            Self::AgentPoolNotFound { .. } => "NECRO-052",
            Self::ShuttingDown => "NECRO-053",
            Self::ShutdownTimeout { .. } => "NECRO-054",
            Self::ContextInvalid { .. } => "NECRO-060",
            Self::CodegenTransient { .. } => "NECRO-061",
            Self::CodegenPermanent { .. } => "NECRO-062",
            Self::TestsFailed { .. } => "NECRO-063",
            Self::TaskTimeout { .. } => "NECRO-064",
            Self::ResourceBreach { .. } => "NECRO-065",
            Self::RunnerStateInvalid { .. } => "NECRO-066",
            Self::TestTimeout { .. } => "NECRO-067",
            Self::ArtifactUpload { .. } => "NECRO-070",
            Self::ResourceConflict { .. } => "NECRO-080",
            Self::PathOutsideWorkspace { .. } => "NECRO-081",
            Self::GitInternalsAccess { .. } => "NECRO-082",
            Self::ForeignBranchPush { .. } => "NECRO-083",
            Self::DangerousCommand { .. } => "NECRO-084",
            Self::Io(_) => "NECRO-093",
            Self::Json(_) => "NECRO-094",
        }
    }

    /// Transient errors may succeed on a later attempt; they drive the retry
    /// policy table rather than failing the task outright.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientRegistry { .. }
                | Self::NoSlotsAvailable { .. }
                | Self::SlotLockTimeout { .. }
                | Self::GitTimeout { .. }
                | Self::CodegenTransient { .. }
                | Self::TaskTimeout { .. }
                | Self::TestTimeout { .. }
                | Self::LaunchFailed { .. }
        )
    }
}

/// Classify a free-form error message as transient when no typed variant is
/// available (external process output, HTTP client errors).
pub fn message_looks_transient(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("rate limit")
        || msg.contains("connection")
        || msg.contains("temporar")
        || msg.contains("unavailable")
        || msg.contains("429")
        || msg.contains("502")
        || msg.contains("503")
        || msg.contains("504")
}
