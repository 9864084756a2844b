//! Structured logging utilities
//!
//! Event helpers for the scheduler, the delayed task runner, the publication
//! state machine and the cache controller. Every event carries an `event` field
//! so JSON output can be filtered by type.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

/// Structured logging utilities
pub struct StructuredLogger;

impl StructuredLogger {
    /// Log job claim
    pub fn log_job_claimed(job_name: &str, owner: &str, next_execution_time: DateTime<Utc>) {
        debug!(
            event = "job_claimed",
            job.name = job_name,
            job.owner = owner,
            job.next_execution_time = %next_execution_time,
            "Job claimed"
        );
    }

    /// Log job run completion
    pub fn log_job_complete(
        job_name: &str,
        owner: &str,
        success: bool,
        duration_ms: u64,
        error_message: Option<&str>,
    ) {
        if success {
            debug!(
                event = "job_complete",
                job.name = job_name,
                job.owner = owner,
                job.duration_ms = duration_ms,
                "Job run completed"
            );
        } else {
            error!(
                event = "job_failed",
                job.name = job_name,
                job.owner = owner,
                job.duration_ms = duration_ms,
                job.error = error_message.unwrap_or("Unknown error"),
                "Job run failed"
            );
        }
    }

    pub fn log_task_inserted(kind: &str, tag: &str, execution_time: DateTime<Utc>) {
        debug!(
            event = "delayed_task_inserted",
            task.kind = kind,
            task.tag = tag,
            task.execution_time = %execution_time,
            "Delayed task inserted"
        );
    }

    /// Log delayed task execution result
    pub fn log_task_complete(kind: &str, success: bool, error_message: Option<&str>) {
        if success {
            debug!(
                event = "delayed_task_complete",
                task.kind = kind,
                "Delayed task executed"
            );
        } else {
            error!(
                event = "delayed_task_failed",
                task.kind = kind,
                task.error = error_message.unwrap_or("Unknown error"),
                "Delayed task failed"
            );
        }
    }

    /// Log publication state transition
    pub fn log_publication_transition(
        publication_id: i64,
        pool_id: i64,
        from_state: &str,
        to_state: &str,
    ) {
        info!(
            event = "publication_transition",
            publication.id = publication_id,
            pool.id = pool_id,
            publication.from = from_state,
            publication.to = to_state,
            "Publication state changed"
        );
    }

    /// Log cache controller decision for one pool
    pub fn log_cache_decision(
        pool_id: i64,
        action: &str,
        l1: i64,
        l2: i64,
        assigned: i64,
    ) {
        info!(
            event = "cache_decision",
            pool.id = pool_id,
            cache.action = action,
            cache.l1 = l1,
            cache.l2 = l2,
            cache.assigned = assigned,
            "Cache level adjusted"
        );
    }

    pub fn log_max_services_reached(pool_id: i64, max: u32) {
        warn!(
            event = "max_services_reached",
            pool.id = pool_id,
            pool.max_deployed = max,
            "Maximum number of deployed services reached"
        );
    }

    /// Log system error
    pub fn log_system_error(component: &str, operation: &str, error: &dyn std::error::Error) {
        error!(
            event = "system_error",
            error.component = component,
            error.operation = operation,
            error.message = %error,
            "System error occurred"
        );
    }

    /// Log worker loop lifecycle
    pub fn log_worker_lifecycle(component: &str, worker_id: &str, started: bool) {
        let event = if started { "worker_started" } else { "worker_stopped" };
        info!(
            event = event,
            worker.component = component,
            worker.id = worker_id,
            "Worker lifecycle changed"
        );
    }
}
