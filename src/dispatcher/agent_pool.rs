//! Agent pool roster and capacity accounting
//!
//! An agent pool is a named execution environment (local process, docker,
//! kubernetes) with a concurrency cap and advisory resource quotas. Counters
//! move under the same lock as the bookkeeping that implies them, so counts
//! and truth never diverge under concurrent completions.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::AgentPoolConfig;
use crate::error::{NecroError, Result};

/// One execution environment with live counters
#[derive(Debug)]
pub struct AgentPool {
    pub config: AgentPoolConfig,
    running: Mutex<usize>,
}

impl AgentPool {
    pub fn new(config: AgentPoolConfig) -> Self {
        Self {
            config,
            running: Mutex::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn current_running(&self) -> usize {
        *self.running.lock()
    }

    /// Enabled, under its concurrency cap, and quota-clean.
    pub fn can_accept_task(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        *self.running.lock() < self.config.max_concurrency
    }

    /// Fraction of capacity in use.
    pub fn utilization(&self) -> f64 {
        let running = *self.running.lock();
        if self.config.max_concurrency == 0 {
            return 1.0;
        }
        running as f64 / self.config.max_concurrency as f64
    }

    /// Reserve one unit of capacity; fails when the cap is reached.
    pub fn acquire(&self) -> Result<()> {
        let mut running = self.running.lock();
        if !self.config.enabled || *running >= self.config.max_concurrency {
            return Err(NecroError::LaunchFailed {
                pool: self.config.name.clone(),
                reason: "pool at capacity or disabled".to_string(),
            });
        }
        *running += 1;
        Ok(())
    }

    pub fn release(&self) {
        let mut running = self.running.lock();
        *running = running.saturating_sub(1);
    }
}

/// Roster of agent pools
#[derive(Debug, Default)]
pub struct AgentPoolManager {
    pools: HashMap<String, Arc<AgentPool>>,
    /// Roster order, used by policies that scan all pools
    order: Vec<String>,
}

impl AgentPoolManager {
    pub fn new(configs: Vec<AgentPoolConfig>) -> Self {
        let mut manager = Self::default();
        for config in configs {
            manager.order.push(config.name.clone());
            manager
                .pools
                .insert(config.name.clone(), Arc::new(AgentPool::new(config)));
        }
        manager
    }

    pub fn get(&self, name: &str) -> Result<Arc<AgentPool>> {
        self.pools
            .get(name)
            .cloned()
            .ok_or_else(|| NecroError::AgentPoolNotFound {
                pool: name.to_string(),
            })
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn total_running(&self) -> usize {
        self.pools.values().map(|p| p.current_running()).sum()
    }

    /// (pool name, running, max, utilization) for metrics export.
    pub fn snapshot(&self) -> Vec<(String, usize, usize, f64)> {
        self.order
            .iter()
            .filter_map(|name| self.pools.get(name))
            .map(|pool| {
                (
                    pool.name().to_string(),
                    pool.current_running(),
                    pool.config.max_concurrency,
                    pool.utilization(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentPoolKind;

    fn config(name: &str, max: usize) -> AgentPoolConfig {
        AgentPoolConfig {
            name: name.to_string(),
            kind: AgentPoolKind::LocalProcess,
            max_concurrency: max,
            cpu_quota: None,
            memory_quota_mb: None,
            enabled: true,
            type_specific: HashMap::new(),
        }
    }

    #[test]
    fn capacity_accounting() {
        let pool = AgentPool::new(config("local", 2));
        assert!(pool.can_accept_task());

        pool.acquire().unwrap();
        pool.acquire().unwrap();
        assert!(!pool.can_accept_task());
        assert!(pool.acquire().is_err());

        pool.release();
        assert!(pool.can_accept_task());
        assert_eq!(pool.current_running(), 1);
    }

    #[test]
    fn release_saturates_at_zero() {
        let pool = AgentPool::new(config("local", 1));
        pool.release();
        assert_eq!(pool.current_running(), 0);
    }

    #[test]
    fn disabled_pool_rejects() {
        let mut cfg = config("off", 4);
        cfg.enabled = false;
        let pool = AgentPool::new(cfg);
        assert!(!pool.can_accept_task());
        assert!(pool.acquire().is_err());
    }

    #[test]
    fn utilization_ratio() {
        let pool = AgentPool::new(config("local", 4));
        pool.acquire().unwrap();
        assert!((pool.utilization() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn manager_preserves_roster_order_and_totals() {
        let manager = AgentPoolManager::new(vec![config("a", 1), config("b", 2)]);
        assert_eq!(manager.names(), ["a", "b"]);

        manager.get("a").unwrap().acquire().unwrap();
        manager.get("b").unwrap().acquire().unwrap();
        assert_eq!(manager.total_running(), 2);

        let snapshot = manager.snapshot();
        assert_eq!(snapshot[0].0, "a");
        assert_eq!(snapshot[0].1, 1);
    }

    #[test]
    fn unknown_pool_is_an_error() {
        let manager = AgentPoolManager::new(vec![]);
        assert!(manager.get("ghost").is_err());
    }
}
