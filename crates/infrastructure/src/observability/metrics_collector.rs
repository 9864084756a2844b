//! Metrics collector for the broker background workers
//!
//! Handles are registered against the global `metrics` recorder. Without an
//! installed recorder every call is a no-op.

use metrics::{counter, histogram, Counter, Histogram};
use tracing::debug;

/// Metrics collector for jobs, delayed tasks and the cache control loop
pub struct MetricsCollector {
    // Job metrics
    job_runs_total: Counter,
    job_failures_total: Counter,
    job_duration: Histogram,

    // Delayed task metrics
    delayed_tasks_inserted_total: Counter,
    delayed_tasks_executed_total: Counter,
    delayed_tasks_failed_total: Counter,
    delayed_task_insert_retries_total: Counter,
    delayed_task_duration: Histogram,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            job_runs_total: counter!("broker_job_runs_total"),
            job_failures_total: counter!("broker_job_failures_total"),
            job_duration: histogram!("broker_job_duration_seconds"),
            delayed_tasks_inserted_total: counter!("broker_delayed_tasks_inserted_total"),
            delayed_tasks_executed_total: counter!("broker_delayed_tasks_executed_total"),
            delayed_tasks_failed_total: counter!("broker_delayed_tasks_failed_total"),
            delayed_task_insert_retries_total: counter!("broker_delayed_task_insert_retries_total"),
            delayed_task_duration: histogram!("broker_delayed_task_duration_seconds"),
        }
    }

    // Job metrics

    /// Record a finished job run
    pub fn record_job_run(&self, job_name: &str, success: bool, duration_seconds: f64) {
        self.job_runs_total.increment(1);
        self.job_duration.record(duration_seconds);
        if !success {
            self.job_failures_total.increment(1);
        }

        debug!(
            job_name = job_name,
            success = success,
            duration_seconds = duration_seconds,
            "Job run recorded"
        );
    }

    // Delayed task metrics

    pub fn record_task_inserted(&self, kind: &str) {
        self.delayed_tasks_inserted_total.increment(1);
        counter!("broker_delayed_tasks_inserted_by_kind_total", "kind" => kind.to_string())
            .increment(1);
    }

    pub fn record_task_insert_retry(&self) {
        self.delayed_task_insert_retries_total.increment(1);
    }

    /// Record a delayed task execution
    pub fn record_task_execution(&self, kind: &str, success: bool, duration_seconds: f64) {
        self.delayed_tasks_executed_total.increment(1);
        self.delayed_task_duration.record(duration_seconds);
        if !success {
            self.delayed_tasks_failed_total.increment(1);
        }

        debug!(
            task_kind = kind,
            success = success,
            duration_seconds = duration_seconds,
            "Delayed task execution recorded"
        );
    }

    // Cache and publication metrics

    /// Record one cache controller decision
    pub fn record_cache_action(&self, action: &str) {
        counter!("broker_cache_actions_total", "action" => action.to_string()).increment(1);
    }

    pub fn record_publication_transition(&self, to_state: &str) {
        counter!("broker_publication_transitions_total", "state" => to_state.to_string())
            .increment(1);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
