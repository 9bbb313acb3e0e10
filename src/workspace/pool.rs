//! Workspace pool: git-worktree-backed slot allocator
//!
//! Physical layout per pool:
//! - `<base>/<pool>/.main_repo/` — single full clone
//! - `<base>/<pool>/worktrees/slot-<n>/` — N worktrees sharing the object store
//! - `<base>/<pool>/pool.json` — pool metadata and per-slot records
//! - `<base>/<pool>/locks/<slot_id>.lock` — per-slot advisory lock
//!
//! At most one runner holds a slot at any time: the per-slot file lock is the
//! arbiter, the persisted record is the audit trail. Allocation picks the
//! least-recently-used AVAILABLE slot and runs pre-allocation cleanup under
//! the slot lock; cleanup failure parks the slot in ERROR and the allocator
//! moves to the next candidate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::WorkspaceConfig;
use crate::error::{NecroError, Result};

use super::git::Git;
use super::lock::{read_holder, FileLock};
use super::slot::{disk_usage, SlotRecord, SlotState, SlotStatus};

/// Persisted pool metadata (`pool.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub name: String,
    pub repo_url: String,
    pub num_slots: usize,
    pub base_path: PathBuf,
    pub slots: Vec<SlotRecord>,
}

/// An allocation handle. Holds the slot's advisory lock; the slot stays
/// exclusively owned until this is passed back to `release_slot`.
#[derive(Debug)]
pub struct AllocatedSlot {
    pub slot_id: String,
    pub pool_name: String,
    pub path: PathBuf,
    pub holding_branch: String,
    pub allocated_to: String,
    lock: FileLock,
}

impl AllocatedSlot {
    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }
}

/// How `release_slot` cleans the worktree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// Mark available immediately, no git cleanup
    Skip,
    /// Clean inline before returning
    Sync,
    /// Return immediately; clean on the bounded background worker pool
    Background,
}

/// One allocation/cleanup observation for the bounded metrics history
#[derive(Debug, Clone, Serialize)]
pub struct PoolOperation {
    pub kind: &'static str,
    pub slot_id: String,
    pub duration_ms: u64,
    pub ok: bool,
}

const METRICS_HISTORY: usize = 1000;

#[derive(Debug, Default)]
struct PoolMetrics {
    allocations: u64,
    allocation_failures: u64,
    cleanups: u64,
    cleanup_failures: u64,
    allocation_latency_ms: u64,
    cleanup_duration_ms: u64,
    history: std::collections::VecDeque<PoolOperation>,
}

impl PoolMetrics {
    fn record(&mut self, op: PoolOperation) {
        match (op.kind, op.ok) {
            ("allocate", true) => {
                self.allocations += 1;
                self.allocation_latency_ms += op.duration_ms;
            }
            ("allocate", false) => self.allocation_failures += 1,
            ("cleanup", true) => {
                self.cleanups += 1;
                self.cleanup_duration_ms += op.duration_ms;
            }
            ("cleanup", false) => self.cleanup_failures += 1,
            _ => {}
        }
        if self.history.len() == METRICS_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(op);
    }
}

/// Aggregate metrics snapshot for one pool
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PoolMetricsSnapshot {
    pub allocations: u64,
    pub allocation_failures: u64,
    pub cleanup_failures: u64,
    pub avg_allocation_latency_ms: u64,
    pub avg_cleanup_duration_ms: u64,
}

struct PoolHandle {
    record: Mutex<PoolRecord>,
    metrics: Mutex<PoolMetrics>,
}

/// Manager for all workspace pools under one base path
pub struct WorkspacePool {
    config: WorkspaceConfig,
    pools: RwLock<HashMap<String, Arc<PoolHandle>>>,
    cleanup_workers: Arc<Semaphore>,
}

impl WorkspacePool {
    pub fn new(config: WorkspaceConfig) -> Self {
        let workers = config.background_cleanup_workers.max(1);
        Self {
            config,
            pools: RwLock::new(HashMap::new()),
            cleanup_workers: Arc::new(Semaphore::new(workers)),
        }
    }

    /// Derive a pool name from a repository URL (xxh3 hex), for callers that
    /// do not pass an explicit name.
    pub fn pool_name_for_url(repo_url: &str) -> String {
        format!("{:016x}", xxhash_rust::xxh3::xxh3_64(repo_url.as_bytes()))
    }

    fn pool_dir(&self, name: &str) -> PathBuf {
        self.config.base_path.join(name)
    }

    fn slot_lock_path(&self, pool: &str, slot_id: &str) -> PathBuf {
        self.pool_dir(pool).join("locks").join(format!("{slot_id}.lock"))
    }

    fn handle(&self, pool: &str) -> Result<Arc<PoolHandle>> {
        if let Some(handle) = self.pools.read().get(pool) {
            return Ok(Arc::clone(handle));
        }
        // Not yet in memory; hydrate from pool.json if present on disk.
        let path = self.pool_dir(pool).join("pool.json");
        if !path.exists() {
            return Err(NecroError::PoolNotFound {
                pool: pool.to_string(),
            });
        }
        let record: PoolRecord = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        let mut pools = self.pools.write();
        let handle = pools.entry(pool.to_string()).or_insert_with(|| {
            Arc::new(PoolHandle {
                record: Mutex::new(record),
                metrics: Mutex::new(PoolMetrics::default()),
            })
        });
        Ok(Arc::clone(handle))
    }

    fn main_repo_git(&self, record: &PoolRecord) -> Git {
        Git::new(record.base_path.join(".main_repo")).with_timeout(self.config.cleanup_timeout())
    }

    // ═══════════════════════════════════════════════════════════════
    // Pool lifecycle
    // ═══════════════════════════════════════════════════════════════

    /// Clone the repository once and create `num_slots` worktrees, each on a
    /// pool-owned holding branch.
    pub async fn create_pool(
        &self,
        name: &str,
        repo_url: &str,
        num_slots: usize,
    ) -> Result<PoolRecord> {
        let dir = self.pool_dir(name);
        if dir.join("pool.json").exists() {
            return Err(NecroError::PoolExists {
                pool: name.to_string(),
                path: dir.display().to_string(),
            });
        }
        std::fs::create_dir_all(dir.join("worktrees"))?;
        std::fs::create_dir_all(dir.join("locks"))?;

        // The pool-level metadata lock guards roster changes only.
        let _meta = FileLock::acquire(
            &dir.join("pool.lock"),
            "create_pool",
            self.config.allocation_lock_timeout(),
            Duration::from_millis(25),
        )?;

        let main = Git::clone_repo(
            repo_url,
            &dir.join(".main_repo"),
            self.config.cleanup_timeout(),
        )
        .await?;

        let mut slots = Vec::with_capacity(num_slots);
        for index in 0..num_slots {
            let slot =
                SlotRecord::new(name, index, dir.join("worktrees").join(format!("slot-{index}")));
            main.worktree_add(&slot.path, &slot.holding_branch).await?;
            slots.push(slot);
        }

        let record = PoolRecord {
            name: name.to_string(),
            repo_url: repo_url.to_string(),
            num_slots,
            base_path: dir,
            slots,
        };
        persist_record(&record)?;
        self.pools.write().insert(
            name.to_string(),
            Arc::new(PoolHandle {
                record: Mutex::new(record.clone()),
                metrics: Mutex::new(PoolMetrics::default()),
            }),
        );

        info!(pool = name, repo_url, num_slots, "workspace pool created");
        Ok(record)
    }

    pub fn get_pool(&self, name: &str) -> Result<PoolRecord> {
        Ok(self.handle(name)?.record.lock().clone())
    }

    // ═══════════════════════════════════════════════════════════════
    // Allocation
    // ═══════════════════════════════════════════════════════════════

    /// Atomically allocate the least-recently-used AVAILABLE slot.
    pub async fn allocate_slot(&self, pool: &str, runner_id: &str) -> Result<AllocatedSlot> {
        let handle = self.handle(pool)?;
        let started = Instant::now();

        // LRU candidate order, computed under the record mutex.
        let candidates: Vec<SlotRecord> = {
            let record = handle.record.lock();
            let mut available: Vec<SlotRecord> = record
                .slots
                .iter()
                .filter(|s| s.state == SlotState::Available)
                .cloned()
                .collect();
            available.sort_by_key(|s| s.last_used_at);
            available
        };

        for candidate in candidates {
            // The file lock arbitrates concurrent allocators; losing the
            // try-lock just means trying the next candidate.
            let lock = match FileLock::try_acquire(
                &self.slot_lock_path(pool, &candidate.slot_id),
                runner_id,
            )? {
                Some(lock) => lock,
                None => continue,
            };

            if let Err(e) = clean_worktree(&self.config, &candidate, false).await {
                warn!(slot = %candidate.slot_id, error = %e, "pre-allocation cleanup failed");
                mutate_slot(&handle, &candidate.slot_id, |s| {
                    s.state = SlotState::Error;
                    s.error_reason = Some(e.to_string());
                })?;
                handle.metrics.lock().record(PoolOperation {
                    kind: "cleanup",
                    slot_id: candidate.slot_id.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    ok: false,
                });
                drop(lock);
                continue;
            }

            let now = Utc::now();
            mutate_slot(&handle, &candidate.slot_id, |s| {
                s.state = SlotState::Allocated;
                s.allocated_to = Some(runner_id.to_string());
                s.allocated_at = Some(now);
                s.current_branch = Some(s.holding_branch.clone());
                s.total_allocations += 1;
            })?;

            handle.metrics.lock().record(PoolOperation {
                kind: "allocate",
                slot_id: candidate.slot_id.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
                ok: true,
            });

            info!(pool, slot = %candidate.slot_id, runner_id, "slot allocated");
            return Ok(AllocatedSlot {
                slot_id: candidate.slot_id,
                pool_name: pool.to_string(),
                path: candidate.path,
                holding_branch: candidate.holding_branch,
                allocated_to: runner_id.to_string(),
                lock,
            });
        }

        handle.metrics.lock().record(PoolOperation {
            kind: "allocate",
            slot_id: String::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            ok: false,
        });
        Err(NecroError::NoSlotsAvailable {
            pool: pool.to_string(),
        })
    }

    /// Release an allocation. `Background` returns immediately and cleans on
    /// the bounded worker pool while still holding the slot lock.
    pub async fn release_slot(&self, allocation: AllocatedSlot, mode: CleanupMode) -> Result<()> {
        let handle = self.handle(&allocation.pool_name)?;

        // Validate the caller still owns the slot per the persisted record.
        {
            let record = handle.record.lock();
            let slot = record
                .slots
                .iter()
                .find(|s| s.slot_id == allocation.slot_id)
                .ok_or_else(|| NecroError::SlotNotFound {
                    slot_id: allocation.slot_id.clone(),
                })?;
            if slot.allocated_to.as_deref() != Some(allocation.allocated_to.as_str()) {
                return Err(NecroError::SlotNotHeld {
                    slot_id: allocation.slot_id.clone(),
                    holder: slot.allocated_to.clone().unwrap_or_default(),
                    caller: allocation.allocated_to.clone(),
                });
            }
        }

        match mode {
            CleanupMode::Skip => {
                apply_release(&handle, &allocation.slot_id, Ok(()))?;
                drop(allocation);
                Ok(())
            }
            CleanupMode::Sync => {
                let slot = slot_record(&handle, &allocation.slot_id)?;
                let started = Instant::now();
                let outcome = clean_worktree(&self.config, &slot, true).await;
                handle.metrics.lock().record(PoolOperation {
                    kind: "cleanup",
                    slot_id: allocation.slot_id.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    ok: outcome.is_ok(),
                });
                apply_release(&handle, &allocation.slot_id, outcome)?;
                drop(allocation);
                Ok(())
            }
            CleanupMode::Background => {
                let slot = slot_record(&handle, &allocation.slot_id)?;
                let config = self.config.clone();
                let permits = Arc::clone(&self.cleanup_workers);
                let handle = Arc::clone(&handle);
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    let started = Instant::now();
                    let outcome = clean_worktree(&config, &slot, true).await;
                    handle.metrics.lock().record(PoolOperation {
                        kind: "cleanup",
                        slot_id: allocation.slot_id.clone(),
                        duration_ms: started.elapsed().as_millis() as u64,
                        ok: outcome.is_ok(),
                    });
                    if let Err(e) = apply_release(&handle, &allocation.slot_id, outcome) {
                        warn!(slot = %allocation.slot_id, error = %e, "background release failed");
                    }
                    // Slot lock drops here, after cleanup.
                    drop(allocation);
                });
                Ok(())
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════
    // Status and resize
    // ═══════════════════════════════════════════════════════════════

    pub async fn get_slot_status(&self, pool: &str, slot_id: &str) -> Result<SlotStatus> {
        let handle = self.handle(pool)?;
        let record = slot_record(&handle, slot_id)?;

        let git = Git::new(&record.path);
        let head_commit = git.head_commit().await.ok();
        let checked_out_branch = git.current_branch().await.ok();
        let lock_holder = read_holder(&self.slot_lock_path(pool, slot_id));
        let disk_usage_bytes = disk_usage(&record.path);

        Ok(SlotStatus {
            record,
            head_commit,
            checked_out_branch,
            disk_usage_bytes,
            lock_holder,
        })
    }

    /// Append one slot to the pool.
    pub async fn add_slot(&self, pool: &str) -> Result<SlotRecord> {
        let handle = self.handle(pool)?;
        let _meta = FileLock::acquire(
            &self.pool_dir(pool).join("pool.lock"),
            "add_slot",
            self.config.allocation_lock_timeout(),
            Duration::from_millis(25),
        )?;

        let (record_snapshot, index) = {
            let record = handle.record.lock();
            let index = record.slots.iter().map(|s| s.index + 1).max().unwrap_or(0);
            (record.clone(), index)
        };

        let slot = SlotRecord::new(
            pool,
            index,
            record_snapshot
                .base_path
                .join("worktrees")
                .join(format!("slot-{index}")),
        );
        self.main_repo_git(&record_snapshot)
            .worktree_add(&slot.path, &slot.holding_branch)
            .await?;

        {
            let mut record = handle.record.lock();
            record.slots.push(slot.clone());
            record.num_slots = record.slots.len();
            persist_record(&record)?;
        }
        info!(pool, slot = %slot.slot_id, "slot added");
        Ok(slot)
    }

    /// Remove a slot. Fails on ALLOCATED slots unless `force`.
    pub async fn remove_slot(&self, pool: &str, slot_id: &str, force: bool) -> Result<()> {
        let handle = self.handle(pool)?;
        let _meta = FileLock::acquire(
            &self.pool_dir(pool).join("pool.lock"),
            "remove_slot",
            self.config.allocation_lock_timeout(),
            Duration::from_millis(25),
        )?;

        let slot = slot_record(&handle, slot_id)?;
        if slot.state == SlotState::Allocated && !force {
            return Err(NecroError::SlotAllocated {
                slot_id: slot_id.to_string(),
            });
        }

        let record_snapshot = handle.record.lock().clone();
        if let Err(e) = self
            .main_repo_git(&record_snapshot)
            .worktree_remove(&slot.path)
            .await
        {
            warn!(pool, slot = slot_id, error = %e, "worktree remove failed, pruning record anyway");
        }

        {
            let mut record = handle.record.lock();
            record.slots.retain(|s| s.slot_id != slot_id);
            record.num_slots = record.slots.len();
            persist_record(&record)?;
        }
        info!(pool, slot = slot_id, force, "slot removed");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════
    // Bulk maintenance
    // ═══════════════════════════════════════════════════════════════

    /// Fetch the object store in every AVAILABLE slot, bounded by the cleanup
    /// worker count. Returns per-slot failures without aborting the sweep.
    pub async fn fetch_all(&self, pool: &str) -> Result<Vec<(String, NecroError)>> {
        let timeout = self.config.cleanup_timeout();
        self.for_each_available_slot(pool, move |slot| async move {
            Git::new(&slot.path).with_timeout(timeout).fetch_origin().await
        })
        .await
    }

    /// Run post-release cleanup over every AVAILABLE slot.
    pub async fn cleanup_all(&self, pool: &str) -> Result<Vec<(String, NecroError)>> {
        let config = self.config.clone();
        self.for_each_available_slot(pool, move |slot| {
            let config = config.clone();
            async move { clean_worktree(&config, &slot, true).await }
        })
        .await
    }

    async fn for_each_available_slot<F, Fut>(
        &self,
        pool: &str,
        op: F,
    ) -> Result<Vec<(String, NecroError)>>
    where
        F: Fn(SlotRecord) -> Fut,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let handle = self.handle(pool)?;
        let slots: Vec<SlotRecord> = handle
            .record
            .lock()
            .slots
            .iter()
            .filter(|s| s.state == SlotState::Available)
            .cloned()
            .collect();

        let mut join_set = JoinSet::new();
        for slot in slots {
            let permits = Arc::clone(&self.cleanup_workers);
            let slot_id = slot.slot_id.clone();
            let fut = op(slot);
            join_set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (slot_id, fut.await)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok((slot_id, Err(e))) = joined {
                failures.push((slot_id, e));
            }
        }
        Ok(failures)
    }

    pub fn metrics(&self, pool: &str) -> Result<PoolMetricsSnapshot> {
        let handle = self.handle(pool)?;
        let metrics = handle.metrics.lock();
        Ok(PoolMetricsSnapshot {
            allocations: metrics.allocations,
            allocation_failures: metrics.allocation_failures,
            cleanup_failures: metrics.cleanup_failures,
            avg_allocation_latency_ms: metrics
                .allocation_latency_ms
                .checked_div(metrics.allocations)
                .unwrap_or(0),
            avg_cleanup_duration_ms: metrics
                .cleanup_duration_ms
                .checked_div(metrics.cleanups)
                .unwrap_or(0),
        })
    }
}

fn persist_record(record: &PoolRecord) -> Result<()> {
    let path = record.base_path.join("pool.json");
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

fn slot_record(handle: &PoolHandle, slot_id: &str) -> Result<SlotRecord> {
    handle
        .record
        .lock()
        .slots
        .iter()
        .find(|s| s.slot_id == slot_id)
        .cloned()
        .ok_or_else(|| NecroError::SlotNotFound {
            slot_id: slot_id.to_string(),
        })
}

fn mutate_slot(
    handle: &PoolHandle,
    slot_id: &str,
    mutate: impl FnOnce(&mut SlotRecord),
) -> Result<()> {
    let mut record = handle.record.lock();
    let slot = record
        .slots
        .iter_mut()
        .find(|s| s.slot_id == slot_id)
        .ok_or_else(|| NecroError::SlotNotFound {
            slot_id: slot_id.to_string(),
        })?;
    mutate(slot);
    persist_record(&record)
}

/// Record the cleanup outcome and flip the slot state on release.
fn apply_release(handle: &PoolHandle, slot_id: &str, cleanup: Result<()>) -> Result<()> {
    let now = Utc::now();
    match cleanup {
        Ok(()) => mutate_slot(handle, slot_id, |s| {
            s.state = SlotState::Available;
            s.allocated_to = None;
            s.allocated_at = None;
            s.last_used_at = Some(now);
            s.current_branch = Some(s.holding_branch.clone());
            s.error_reason = None;
        }),
        Err(e) => {
            warn!(slot = slot_id, error = %e, "post-release cleanup failed");
            mutate_slot(handle, slot_id, |s| {
                s.state = SlotState::Error;
                s.allocated_to = None;
                s.allocated_at = None;
                s.last_used_at = Some(now);
                s.error_reason = Some(e.to_string());
            })
        }
    }
}

/// Pre-allocation cleanup: checkout holding branch, hard reset, clean.
/// Post-release cleanup (`fetch = true`) additionally refreshes the object
/// store; a failed fetch is logged but does not fail the cleanup (offline
/// fixtures and file remotes are not an ERROR condition).
async fn clean_worktree(config: &WorkspaceConfig, slot: &SlotRecord, fetch: bool) -> Result<()> {
    let git = Git::new(&slot.path).with_timeout(config.cleanup_timeout());
    let run = async {
        git.checkout(&slot.holding_branch).await?;
        git.reset_hard().await?;
        git.clean_fdx().await?;
        if fetch {
            if let Err(e) = git.fetch_origin().await {
                warn!(slot = %slot.slot_id, error = %e, "fetch origin failed");
            }
        }
        Ok::<(), NecroError>(())
    };
    run.await.map_err(|e| NecroError::SlotCleanupFailed {
        slot_id: slot.slot_id.clone(),
        reason: e.to_string(),
    })
}
