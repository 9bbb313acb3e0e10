//! Retry bookkeeping with exponential backoff
//!
//! Per task: attempt count, last failure, and the earliest instant the next
//! attempt may start. Backoff: `min(initial · base^(attempt-1), max)`.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Backoff shape, defaults per the dispatcher contract
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_base: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Scheduled delay before attempt `n + 1`, given `n` recorded failures.
    pub fn delay_after_failures(&self, failures: u32) -> Duration {
        let exp = self.backoff_base.powi(failures.saturating_sub(1) as i32);
        let delay = self.initial_delay.as_secs_f64() * exp;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Per-task retry record
#[derive(Debug, Clone)]
pub struct RetryRecord {
    pub attempt_count: u32,
    pub last_failure_time: Instant,
    pub last_failure_reason: String,
    pub next_eligible_time: Instant,
}

/// Tracks failures and gates retries
#[derive(Debug, Default)]
pub struct RetryManager {
    policy: RetryPolicy,
    records: DashMap<String, RetryRecord>,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            records: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failure and return the updated record.
    pub fn record_failure(&self, key: &str, reason: &str) -> RetryRecord {
        let now = Instant::now();
        let mut entry = self.records.entry(key.to_string()).or_insert(RetryRecord {
            attempt_count: 0,
            last_failure_time: now,
            last_failure_reason: String::new(),
            next_eligible_time: now,
        });
        entry.attempt_count += 1;
        entry.last_failure_time = now;
        entry.last_failure_reason = reason.to_string();
        entry.next_eligible_time = now + self.policy.delay_after_failures(entry.attempt_count);
        entry.clone()
    }

    pub fn attempts(&self, key: &str) -> u32 {
        self.records.get(key).map(|r| r.attempt_count).unwrap_or(0)
    }

    /// Attempts remain under the budget (ignores the backoff clock).
    pub fn can_retry(&self, key: &str) -> bool {
        self.attempts(key) < self.policy.max_attempts
    }

    /// The backoff delay has elapsed (true when no failures are recorded).
    pub fn is_eligible(&self, key: &str) -> bool {
        self.records
            .get(key)
            .map(|r| Instant::now() >= r.next_eligible_time)
            .unwrap_or(true)
    }

    /// attempt_count < max_attempts AND now >= next_eligible_time.
    pub fn should_retry(&self, key: &str) -> bool {
        self.can_retry(key) && self.is_eligible(key)
    }

    pub fn record(&self, key: &str) -> Option<RetryRecord> {
        self.records.get(key).map(|r| r.clone())
    }

    /// Clear the record after a successful run.
    pub fn clear(&self, key: &str) {
        self.records.remove(key);
    }
}
