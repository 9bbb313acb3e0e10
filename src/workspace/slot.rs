//! Slot records and status reporting

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Allocation state of one worktree slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotState {
    Available,
    Allocated,
    /// Cleanup failed; excluded from allocation until operator intervention
    Error,
}

/// Persisted per-slot record inside `pool.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotRecord {
    /// `<pool_name>-<index>`
    pub slot_id: String,
    pub index: usize,
    pub path: PathBuf,
    pub state: SlotState,
    /// Pool-owned parking branch (`worktree/<pool>/slot-<n>`)
    pub holding_branch: String,
    #[serde(default)]
    pub current_branch: Option<String>,
    #[serde(default)]
    pub allocated_to: Option<String>,
    #[serde(default)]
    pub allocated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_allocations: u64,
    #[serde(default)]
    pub error_reason: Option<String>,
}

impl SlotRecord {
    pub fn new(pool_name: &str, index: usize, path: PathBuf) -> Self {
        Self {
            slot_id: format!("{pool_name}-{index}"),
            index,
            path,
            state: SlotState::Available,
            holding_branch: format!("worktree/{pool_name}/slot-{index}"),
            current_branch: None,
            allocated_to: None,
            allocated_at: None,
            last_used_at: None,
            total_allocations: 0,
            error_reason: None,
        }
    }
}

/// Point-in-time view of a slot for operators
#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub record: SlotRecord,
    pub head_commit: Option<String>,
    pub checked_out_branch: Option<String>,
    pub disk_usage_bytes: u64,
    pub lock_holder: Option<String>,
}

/// Recursive directory size. Best effort: unreadable entries count as zero.
pub fn disk_usage(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            total += disk_usage(&entry.path());
        } else {
            total += meta.len();
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_slot_is_available_on_holding_branch() {
        let slot = SlotRecord::new("local", 2, PathBuf::from("/tmp/wt/slot-2"));
        assert_eq!(slot.slot_id, "local-2");
        assert_eq!(slot.state, SlotState::Available);
        assert_eq!(slot.holding_branch, "worktree/local/slot-2");
        assert_eq!(slot.total_allocations, 0);
    }

    #[test]
    fn slot_state_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&SlotState::Allocated).unwrap(),
            "\"ALLOCATED\""
        );
    }

    #[test]
    fn disk_usage_counts_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b"), vec![0u8; 50]).unwrap();
        assert_eq!(disk_usage(dir.path()), 150);
    }
}
