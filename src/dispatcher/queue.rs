//! Thread-safe priority queue
//!
//! Ordering: priority DESC, created_at ASC, monotonic sequence ASC. The
//! sequence counter makes equal-priority same-timestamp entries stable FIFO.
//! Duplicate (spec, task) pairs are rejected so the poller can blindly
//! re-offer ready tasks every tick.

use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::registry::task::TaskId;

/// One queued unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub spec: String,
    pub task_id: TaskId,
    pub priority: i32,
    pub required_skill: String,
    pub created_at: DateTime<Utc>,
    seq: u64,
}

impl QueuedTask {
    pub fn key(&self) -> String {
        format!("{}/{}", self.spec, self.task_id)
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap pops the max; "greater" means "dequeues first".
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<QueuedTask>,
    keys: HashSet<String>,
}

/// Priority queue shared between the poller and the dispatch loop
#[derive(Default)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    seq: AtomicU64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue unless the (spec, task) pair is already queued. Returns true
    /// when newly added.
    pub fn push(
        &self,
        spec: &str,
        task_id: TaskId,
        priority: i32,
        required_skill: &str,
        created_at: DateTime<Utc>,
    ) -> bool {
        let entry = QueuedTask {
            spec: spec.to_string(),
            task_id,
            priority,
            required_skill: required_skill.to_string(),
            created_at,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
        };
        let mut inner = self.inner.lock();
        if !inner.keys.insert(entry.key()) {
            return false;
        }
        inner.heap.push(entry);
        true
    }

    /// Highest-priority oldest task.
    pub fn pop(&self) -> Option<QueuedTask> {
        let mut inner = self.inner.lock();
        let entry = inner.heap.pop()?;
        inner.keys.remove(&entry.key());
        Some(entry)
    }

    pub fn peek(&self) -> Option<QueuedTask> {
        self.inner.lock().heap.peek().cloned()
    }

    pub fn contains(&self, spec: &str, task_id: &TaskId) -> bool {
        self.inner.lock().keys.contains(&format!("{spec}/{task_id}"))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-key a queued task's priority; takes effect on the next dequeue.
    /// Returns false when the task is not queued.
    pub fn update_priority(&self, spec: &str, task_id: &TaskId, priority: i32) -> bool {
        let mut inner = self.inner.lock();
        let key = format!("{spec}/{task_id}");
        if !inner.keys.contains(&key) {
            return false;
        }
        let entries: Vec<QueuedTask> = std::mem::take(&mut inner.heap).into_vec();
        inner.heap = entries
            .into_iter()
            .map(|mut entry| {
                if entry.key() == key {
                    entry.priority = priority;
                }
                entry
            })
            .collect();
        true
    }
}
