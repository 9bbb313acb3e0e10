//! Deadlock detection over the active task graph
//!
//! Once dynamic edits are allowed, cycles can appear after creation-time
//! validation. The detector periodically runs DFS over non-terminal tasks
//! and warns with the cycle path and a remediation hint. Detection is
//! advisory; no cycle is ever auto-broken.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::warn;

use crate::registry::task::{TaskId, Taskset};
use crate::registry::TaskRegistry;

/// A detected cycle, first node repeated at the end
#[derive(Debug, Clone, PartialEq)]
pub struct Cycle {
    pub spec: String,
    pub path: Vec<TaskId>,
}

/// Find cycles among non-terminal tasks of one taskset.
pub fn find_cycles(taskset: &Taskset) -> Vec<Cycle> {
    let active: FxHashMap<&TaskId, Vec<&TaskId>> = taskset
        .tasks
        .iter()
        .filter(|t| !t.state.is_terminal())
        .map(|t| {
            let deps: Vec<&TaskId> = t
                .dependencies
                .iter()
                .filter(|dep| {
                    taskset
                        .task(dep)
                        .map(|d| !d.state.is_terminal())
                        .unwrap_or(false)
                })
                .collect();
            (&t.id, deps)
        })
        .collect();

    let mut done: FxHashSet<&TaskId> = FxHashSet::default();
    let mut cycles = Vec::new();

    for start in active.keys() {
        if done.contains(*start) {
            continue;
        }
        let mut path: Vec<&TaskId> = Vec::new();
        let mut on_path: FxHashSet<&TaskId> = FxHashSet::default();
        if let Some(cycle) = dfs(start, &active, &mut done, &mut path, &mut on_path) {
            // Mark participants done so the same cycle is reported once no
            // matter which node the scan enters from.
            for id in &cycle {
                if let Some((key, _)) = active.get_key_value(id) {
                    done.insert(key);
                }
            }
            cycles.push(Cycle {
                spec: taskset.spec_name.clone(),
                path: cycle,
            });
        }
    }
    cycles
}

fn dfs<'a>(
    node: &'a TaskId,
    graph: &FxHashMap<&'a TaskId, Vec<&'a TaskId>>,
    done: &mut FxHashSet<&'a TaskId>,
    path: &mut Vec<&'a TaskId>,
    on_path: &mut FxHashSet<&'a TaskId>,
) -> Option<Vec<TaskId>> {
    if done.contains(node) {
        return None;
    }
    if on_path.contains(node) {
        let start = path.iter().position(|p| *p == node).unwrap_or(0);
        let mut cycle: Vec<TaskId> = path[start..].iter().map(|p| (*p).clone()).collect();
        cycle.push(node.clone());
        return Some(cycle);
    }

    path.push(node);
    on_path.insert(node);
    if let Some(deps) = graph.get(node) {
        for dep in deps {
            if let Some(cycle) = dfs(dep, graph, done, path, on_path) {
                return Some(cycle);
            }
        }
    }
    path.pop();
    on_path.remove(node);
    done.insert(node);
    None
}

/// Scan every spec in the registry and warn on each detected cycle.
pub fn scan(registry: &TaskRegistry) -> Vec<Cycle> {
    let mut all = Vec::new();
    let specs = match registry.list_specs() {
        Ok(specs) => specs,
        Err(e) => {
            warn!(error = %e, "deadlock scan could not list specs");
            return all;
        }
    };

    for spec in specs {
        let Ok(taskset) = registry.get_taskset(&spec) else {
            continue;
        };
        for cycle in find_cycles(&taskset) {
            let path: Vec<&str> = cycle.path.iter().map(|id| id.as_str()).collect();
            warn!(
                spec = %cycle.spec,
                cycle = %path.join(" -> "),
                "dependency cycle among active tasks; break it by editing one task's \
                 dependencies or marking a participant FAILED"
            );
            all.push(cycle);
        }
    }
    all
}
