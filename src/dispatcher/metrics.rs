//! Dispatcher metrics with Prometheus text exposition
//!
//! Gauges track the live picture (queue size, running counts, utilization);
//! counters accumulate over the dispatcher's lifetime. Wait-time samples are
//! bounded so long-running dispatchers keep constant memory.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

const WAIT_SAMPLES: usize = 1000;

#[derive(Debug, Default)]
struct MetricsInner {
    queue_size: usize,
    global_running: usize,
    /// (pool, running, max, utilization)
    pools: Vec<(String, usize, usize, f64)>,
    tasks_assigned: u64,
    tasks_completed: u64,
    tasks_failed: u64,
    tasks_retried: u64,
    launch_failures: u64,
    runner_timeouts: u64,
    journal_fallbacks: u64,
    wait_times: VecDeque<Duration>,
}

/// Shared metrics sink for the dispatcher and its components
#[derive(Debug, Default)]
pub struct MetricsCollector {
    inner: Mutex<MetricsInner>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_queue_size(&self, size: usize) {
        self.inner.lock().queue_size = size;
    }

    pub fn set_global_running(&self, running: usize) {
        self.inner.lock().global_running = running;
    }

    pub fn set_pool_snapshot(&self, pools: Vec<(String, usize, usize, f64)>) {
        self.inner.lock().pools = pools;
    }

    pub fn set_journal_fallbacks(&self, count: u64) {
        self.inner.lock().journal_fallbacks = count;
    }

    pub fn task_assigned(&self, waited: Duration) {
        let mut inner = self.inner.lock();
        inner.tasks_assigned += 1;
        if inner.wait_times.len() == WAIT_SAMPLES {
            inner.wait_times.pop_front();
        }
        inner.wait_times.push_back(waited);
    }

    pub fn task_completed(&self) {
        self.inner.lock().tasks_completed += 1;
    }

    pub fn task_failed(&self) {
        self.inner.lock().tasks_failed += 1;
    }

    pub fn task_retried(&self) {
        self.inner.lock().tasks_retried += 1;
    }

    pub fn launch_failure(&self) {
        self.inner.lock().launch_failures += 1;
    }

    pub fn runner_timeout(&self) {
        self.inner.lock().runner_timeouts += 1;
    }

    pub fn completed_count(&self) -> u64 {
        self.inner.lock().tasks_completed
    }

    pub fn failed_count(&self) -> u64 {
        self.inner.lock().tasks_failed
    }

    /// Prometheus text exposition of the current snapshot.
    pub fn render_prometheus(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();

        let gauge = |out: &mut String, name: &str, help: &str, value: String| {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"));
        };
        let counter = |out: &mut String, name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        };

        gauge(
            &mut out,
            "necrocode_queue_size",
            "Tasks waiting in the dispatch queue",
            inner.queue_size.to_string(),
        );
        gauge(
            &mut out,
            "necrocode_running_total",
            "Runners currently executing",
            inner.global_running.to_string(),
        );

        out.push_str("# HELP necrocode_pool_running Runners executing per pool\n");
        out.push_str("# TYPE necrocode_pool_running gauge\n");
        for (pool, running, _, _) in &inner.pools {
            out.push_str(&format!(
                "necrocode_pool_running{{pool=\"{pool}\"}} {running}\n"
            ));
        }
        out.push_str("# HELP necrocode_pool_utilization Per-pool capacity utilization\n");
        out.push_str("# TYPE necrocode_pool_utilization gauge\n");
        for (pool, _, _, utilization) in &inner.pools {
            out.push_str(&format!(
                "necrocode_pool_utilization{{pool=\"{pool}\"}} {utilization:.3}\n"
            ));
        }

        counter(
            &mut out,
            "necrocode_tasks_assigned_total",
            "Tasks assigned to runners",
            inner.tasks_assigned,
        );
        counter(
            &mut out,
            "necrocode_tasks_completed_total",
            "Tasks completed successfully",
            inner.tasks_completed,
        );
        counter(
            &mut out,
            "necrocode_tasks_failed_total",
            "Tasks failed terminally",
            inner.tasks_failed,
        );
        counter(
            &mut out,
            "necrocode_tasks_retried_total",
            "Task retry attempts",
            inner.tasks_retried,
        );
        counter(
            &mut out,
            "necrocode_launch_failures_total",
            "Runner launch failures",
            inner.launch_failures,
        );
        counter(
            &mut out,
            "necrocode_runner_timeouts_total",
            "Runners lost to heartbeat timeout",
            inner.runner_timeouts,
        );
        counter(
            &mut out,
            "necrocode_journal_fallbacks_total",
            "Events rerouted to the fallback journal",
            inner.journal_fallbacks,
        );

        if !inner.wait_times.is_empty() {
            let avg: Duration =
                inner.wait_times.iter().sum::<Duration>() / inner.wait_times.len() as u32;
            gauge(
                &mut out,
                "necrocode_task_wait_seconds_avg",
                "Average queue wait over the last samples",
                format!("{:.3}", avg.as_secs_f64()),
            );
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_gauges_and_counters() {
        let metrics = MetricsCollector::new();
        metrics.set_queue_size(3);
        metrics.set_global_running(2);
        metrics.set_pool_snapshot(vec![
            ("local".into(), 2, 4, 0.5),
            ("k8s".into(), 0, 8, 0.0),
        ]);
        metrics.task_assigned(Duration::from_millis(250));
        metrics.task_completed();
        metrics.task_failed();

        let text = metrics.render_prometheus();
        assert!(text.contains("necrocode_queue_size 3"));
        assert!(text.contains("necrocode_running_total 2"));
        assert!(text.contains("necrocode_pool_running{pool=\"local\"} 2"));
        assert!(text.contains("necrocode_pool_utilization{pool=\"local\"} 0.500"));
        assert!(text.contains("necrocode_pool_running{pool=\"k8s\"} 0"));
        assert!(text.contains("necrocode_tasks_assigned_total 1"));
        assert!(text.contains("necrocode_tasks_completed_total 1"));
        assert!(text.contains("necrocode_tasks_failed_total 1"));
        assert!(text.contains("# TYPE necrocode_queue_size gauge"));
        assert!(text.contains("# TYPE necrocode_tasks_completed_total counter"));
    }

    #[test]
    fn wait_time_average_reported() {
        let metrics = MetricsCollector::new();
        metrics.task_assigned(Duration::from_secs(1));
        metrics.task_assigned(Duration::from_secs(3));

        let text = metrics.render_prometheus();
        assert!(text.contains("necrocode_task_wait_seconds_avg 2.000"));
    }

    #[test]
    fn wait_samples_are_bounded() {
        let metrics = MetricsCollector::new();
        for _ in 0..(WAIT_SAMPLES + 100) {
            metrics.task_assigned(Duration::from_millis(1));
        }
        assert_eq!(metrics.inner.lock().wait_times.len(), WAIT_SAMPLES);
    }
}
