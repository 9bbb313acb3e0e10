//! Policy-driven pool assignment
//!
//! - FIFO / PRIORITY: queue order already encodes the policy; pool choice is
//!   the first accepting pool in roster order.
//! - SKILL_BASED: consult the skill mapping (with `default` fallback), first
//!   accepting candidate wins.
//! - FAIR_SHARE: among accepting skill candidates, lowest utilization wins.
//!
//! The policy can be swapped at runtime; in-flight work is unaffected.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::info;

use crate::config::SchedulingPolicy;

use super::agent_pool::AgentPoolManager;

/// Runtime-swappable scheduling policy
#[derive(Debug)]
pub struct Scheduler {
    policy: RwLock<SchedulingPolicy>,
    skills: HashMap<String, Vec<String>>,
}

impl Scheduler {
    pub fn new(policy: SchedulingPolicy, skills: HashMap<String, Vec<String>>) -> Self {
        Self {
            policy: RwLock::new(policy),
            skills,
        }
    }

    pub fn policy(&self) -> SchedulingPolicy {
        *self.policy.read()
    }

    /// Swap the policy; subsequent dispatch uses the new one.
    pub fn set_policy(&self, policy: SchedulingPolicy) {
        let previous = std::mem::replace(&mut *self.policy.write(), policy);
        if previous != policy {
            info!(?previous, ?policy, "scheduling policy changed");
        }
    }

    /// Ordered candidate pool names for a skill.
    fn candidates<'a>(&'a self, skill: &str, pools: &'a AgentPoolManager) -> Vec<&'a str> {
        match self.policy() {
            SchedulingPolicy::Fifo | SchedulingPolicy::Priority => {
                pools.names().iter().map(String::as_str).collect()
            }
            SchedulingPolicy::SkillBased | SchedulingPolicy::FairShare => self
                .skills
                .get(skill)
                .or_else(|| self.skills.get("default"))
                .map(|names| names.iter().map(String::as_str).collect())
                .unwrap_or_else(|| pools.names().iter().map(String::as_str).collect()),
        }
    }

    /// Pick a pool that passes `can_accept_task`, or None when the system is
    /// saturated for this skill.
    pub fn select_pool(&self, skill: &str, pools: &AgentPoolManager) -> Option<String> {
        let candidates = self.candidates(skill, pools);

        match self.policy() {
            SchedulingPolicy::FairShare => candidates
                .iter()
                .filter_map(|name| pools.get(name).ok())
                .filter(|pool| pool.can_accept_task())
                .min_by(|a, b| {
                    a.utilization()
                        .partial_cmp(&b.utilization())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|pool| pool.name().to_string()),
            _ => candidates
                .iter()
                .filter_map(|name| pools.get(name).ok())
                .find(|pool| pool.can_accept_task())
                .map(|pool| pool.name().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentPoolConfig, AgentPoolKind};

    fn pool(name: &str, max: usize) -> AgentPoolConfig {
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

    fn skills() -> HashMap<String, Vec<String>> {
        HashMap::from([
            ("backend".to_string(), vec!["heavy".to_string(), "light".to_string()]),
            ("default".to_string(), vec!["light".to_string()]),
        ])
    }

    #[test]
    fn skill_based_prefers_mapped_pool_order() {
        let pools = AgentPoolManager::new(vec![pool("light", 4), pool("heavy", 4)]);
        let scheduler = Scheduler::new(SchedulingPolicy::SkillBased, skills());

        assert_eq!(scheduler.select_pool("backend", &pools).unwrap(), "heavy");
    }

    #[test]
    fn unmapped_skill_falls_back_to_default() {
        let pools = AgentPoolManager::new(vec![pool("light", 4), pool("heavy", 4)]);
        let scheduler = Scheduler::new(SchedulingPolicy::SkillBased, skills());

        assert_eq!(scheduler.select_pool("frontend", &pools).unwrap(), "light");
    }

    #[test]
    fn saturated_candidates_yield_none() {
        let pools = AgentPoolManager::new(vec![pool("light", 1)]);
        let scheduler = Scheduler::new(
            SchedulingPolicy::SkillBased,
            HashMap::from([("default".to_string(), vec!["light".to_string()])]),
        );

        pools.get("light").unwrap().acquire().unwrap();
        assert!(scheduler.select_pool("anything", &pools).is_none());
    }

    #[test]
    fn skill_based_skips_full_pool_for_next_candidate() {
        let pools = AgentPoolManager::new(vec![pool("light", 4), pool("heavy", 1)]);
        let scheduler = Scheduler::new(SchedulingPolicy::SkillBased, skills());

        pools.get("heavy").unwrap().acquire().unwrap();
        assert_eq!(scheduler.select_pool("backend", &pools).unwrap(), "light");
    }

    #[test]
    fn fair_share_picks_lowest_utilization() {
        let pools = AgentPoolManager::new(vec![pool("heavy", 4), pool("light", 4)]);
        let scheduler = Scheduler::new(SchedulingPolicy::FairShare, skills());

        // heavy: 2/4, light: 1/4 -> light wins despite mapping order.
        pools.get("heavy").unwrap().acquire().unwrap();
        pools.get("heavy").unwrap().acquire().unwrap();
        pools.get("light").unwrap().acquire().unwrap();

        assert_eq!(scheduler.select_pool("backend", &pools).unwrap(), "light");
    }

    #[test]
    fn fifo_scans_roster_order() {
        let pools = AgentPoolManager::new(vec![pool("a", 1), pool("b", 1)]);
        let scheduler = Scheduler::new(SchedulingPolicy::Fifo, HashMap::new());

        assert_eq!(scheduler.select_pool("whatever", &pools).unwrap(), "a");
        pools.get("a").unwrap().acquire().unwrap();
        assert_eq!(scheduler.select_pool("whatever", &pools).unwrap(), "b");
    }

    #[test]
    fn policy_swap_is_visible_immediately() {
        let pools = AgentPoolManager::new(vec![pool("heavy", 4), pool("light", 4)]);
        let scheduler = Scheduler::new(SchedulingPolicy::SkillBased, skills());
        assert_eq!(scheduler.select_pool("backend", &pools).unwrap(), "heavy");

        pools.get("heavy").unwrap().acquire().unwrap();
        scheduler.set_policy(SchedulingPolicy::FairShare);
        assert_eq!(scheduler.policy(), SchedulingPolicy::FairShare);
        assert_eq!(scheduler.select_pool("backend", &pools).unwrap(), "light");
    }
}
