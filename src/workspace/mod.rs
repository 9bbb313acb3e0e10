//! Workspace pool subsystem: advisory locks, the git CLI wrapper, and the
//! worktree-backed slot allocator.

pub mod git;
pub mod lock;
pub mod pool;
pub mod slot;

pub use pool::{AllocatedSlot, CleanupMode, PoolRecord, WorkspacePool};
pub use slot::{SlotRecord, SlotState, SlotStatus};
