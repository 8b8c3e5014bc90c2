//! Prometheus metrics for job runs, repo syncs, gates and task polling.

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

use crate::error::{AppError, Result};
use crate::models::job_run::{JobRun, JobRunStatus};
use crate::models::repo::RepoOutcome;

/// Install the Prometheus recorder with its own HTTP listener.
pub fn init_metrics(bind: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(bind)
        .install()
        .map_err(|e| AppError::Internal(format!("failed to install Prometheus recorder: {}", e)))?;
    tracing::info!("Prometheus metrics listening on {}", bind);
    Ok(())
}

/// Record a finished job run and its duration.
pub fn record_job_run(run: &JobRun, status: JobRunStatus, finished_at: DateTime<Utc>) {
    let task = run.task.label();
    counter!(
        "pulp_manager_job_runs_total",
        "server" => run.server_name.clone(),
        "task" => task,
        "status" => status.as_str()
    )
    .increment(1);

    if let Some(started) = run.started_at {
        histogram!("pulp_manager_job_run_duration_seconds", "task" => task)
            .record(elapsed_secs(started, finished_at));
    }
}

/// Record the terminal outcome of one repo workflow.
pub fn record_repo_outcome(server: &str, outcome: &RepoOutcome) {
    let reason = outcome.reason.map(|r| r.as_str()).unwrap_or("none");
    counter!(
        "pulp_manager_repo_syncs_total",
        "server" => server.to_string(),
        "state" => outcome.state.as_str(),
        "reason" => reason
    )
    .increment(1);
}

/// Current number of admitted workflows behind a gate.
pub fn set_gate_in_flight(gate: &str, server: &str, in_flight: usize) {
    gauge!(
        "pulp_manager_gate_in_flight",
        "gate" => gate.to_string(),
        "server" => server.to_string()
    )
    .set(in_flight as f64);
}

/// Record one poll of a remote task (`ok`, `error` or `terminal`).
pub fn record_task_poll(result: &'static str) {
    counter!("pulp_manager_task_polls_total", "result" => result).increment(1);
}

/// Record a schedule firing; `created` is false when an active run blocked it.
pub fn record_schedule_fire(task: &'static str, created: bool) {
    let outcome = if created { "created" } else { "skipped" };
    counter!("pulp_manager_schedule_fires_total", "task" => task, "outcome" => outcome)
        .increment(1);
}

/// Update database connection pool gauge metrics.
pub fn set_db_pool_gauges(pool: &sqlx::PgPool) {
    let size = pool.size() as f64;
    let idle = pool.num_idle() as f64;
    gauge!("pulp_manager_db_pool_connections_active").set(size - idle);
    gauge!("pulp_manager_db_pool_connections_idle").set(idle);
    gauge!("pulp_manager_db_pool_connections_max").set(pool.options().get_max_connections() as f64);
}

fn elapsed_secs(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let millis = (end - start).num_milliseconds().max(0);
    millis as f64 / 1000.0
}
