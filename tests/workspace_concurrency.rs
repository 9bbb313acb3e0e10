//! Concurrency properties of the worktree pool: exclusive slot ownership
//! under parallel allocators, and clean handoff across release/allocate.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use necrocode::config::WorkspaceConfig;
use necrocode::error::NecroError;
use necrocode::workspace::git::Git;
use necrocode::workspace::{CleanupMode, SlotState, WorkspacePool};

async fn fixture(slots: usize) -> (tempfile::TempDir, Arc<WorkspacePool>) {
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

    let pool = Arc::new(WorkspacePool::new(WorkspaceConfig {
        base_path: dir.path().join("pools"),
        num_slots_per_pool: slots,
        cleanup_timeout_secs: 60,
        allocation_lock_timeout_ms: 200,
        background_cleanup_workers: 2,
    }));
    pool.create_pool("shared", &origin.display().to_string(), slots)
        .await
        .unwrap();
    (dir, pool)
}

#[tokio::test]
async fn parallel_allocators_never_share_a_slot() {
    let (_dir, pool) = fixture(2).await;

    // Six allocators race for two slots; winners hold distinct slots, losers
    // see no_slots_available.
    let mut handles = Vec::new();
    for i in 0..6 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            pool.allocate_slot("shared", &format!("runner-{i}")).await
        }));
    }

    let mut held = Vec::new();
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(slot) => held.push(slot),
            Err(NecroError::NoSlotsAvailable { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(held.len(), 2);
    assert_eq!(rejected, 4);
    let ids: HashSet<&str> = held.iter().map(|s| s.slot_id.as_str()).collect();
    assert_eq!(ids.len(), 2, "two winners must hold distinct slots");

    // Pool record agrees: every held slot is ALLOCATED to its winner.
    let record = pool.get_pool("shared").unwrap();
    for slot in &held {
        let persisted = record
            .slots
            .iter()
            .find(|s| s.slot_id == slot.slot_id)
            .unwrap();
        assert_eq!(persisted.state, SlotState::Allocated);
        assert_eq!(persisted.allocated_to.as_deref(), Some(slot.allocated_to.as_str()));
    }
}

#[tokio::test]
async fn release_allocate_cycles_preserve_isolation() {
    let (_dir, pool) = fixture(1).await;

    for round in 0..3 {
        let slot = pool
            .allocate_slot("shared", &format!("runner-{round}"))
            .await
            .unwrap();

        // Leave droppings that the next allocation must not see.
        std::fs::write(slot.path.join("scratch.txt"), format!("round {round}")).unwrap();
        let path = slot.path.clone();

        pool.release_slot(slot, CleanupMode::Sync).await.unwrap();
        assert!(
            !path.join("scratch.txt").exists(),
            "round {round} left scratch behind"
        );
    }

    let record = pool.get_pool("shared").unwrap();
    assert_eq!(record.slots[0].total_allocations, 3);
    assert_eq!(record.slots[0].state, SlotState::Available);
}

#[tokio::test]
async fn background_release_eventually_frees_the_slot() {
    let (_dir, pool) = fixture(1).await;

    let slot = pool.allocate_slot("shared", "runner-bg").await.unwrap();
    std::fs::write(slot.path.join("scratch.txt"), "bg").unwrap();
    pool.release_slot(slot, CleanupMode::Background).await.unwrap();

    // Background cleanup finishes and the slot comes back AVAILABLE.
    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    loop {
        let record = pool.get_pool("shared").unwrap();
        if record.slots[0].state == SlotState::Available
            && record.slots[0].allocated_to.is_none()
        {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "background cleanup never completed"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let next = pool.allocate_slot("shared", "runner-after").await.unwrap();
    assert!(!next.path.join("scratch.txt").exists());
}
