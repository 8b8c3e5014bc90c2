//! Process configuration loaded from environment variables.
//!
//! The fleet itself (servers, repo groups, schedules) lives in the YAML sync
//! config; see [`crate::services::fleet_config_service`].

use crate::error::{AppError, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Where the sync config is read from when `SYNC_CONFIG_PATH` is unset.
pub const DEFAULT_SYNC_CONFIG_PATH: &str = "/etc/pulp-manager/sync_config.yml";

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Upper bound on pooled database connections
    pub db_max_connections: u32,

    /// Path to the YAML fleet/sync configuration
    pub sync_config_path: PathBuf,

    /// How often the scheduler evaluates cron schedules
    pub scheduler_tick: Duration,

    /// How often the fleet config is re-read from disk
    pub config_reload_interval: Duration,

    /// Number of job runs a single worker executes at once
    pub worker_max_parallel_runs: usize,

    /// Name this worker records against claimed runs
    pub worker_name: String,

    /// Interval between polls of a remote task
    pub task_poll_interval: Duration,

    /// Consecutive transport failures tolerated while polling a remote task
    pub task_poll_failure_budget: u32,

    /// Attempts per remote step before a transient error fails the repo
    pub sync_retry_attempts: u32,

    /// Base delay for exponential backoff between step attempts
    pub sync_retry_base: Duration,

    /// Timeout applied to a single credential lookup
    pub credential_timeout: Duration,

    /// Timeout applied to every HTTP request to a repository server
    pub http_timeout: Duration,

    /// How often a store-backed queue looks for pending runs
    pub queue_poll_interval: Duration,

    /// URL scheme used for repository-server API calls
    pub pulp_api_scheme: String,

    /// Prometheus listener address (metrics disabled when unset)
    pub metrics_bind_address: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| AppError::Config("DATABASE_URL not set".into()))?,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", 10),
            sync_config_path: env::var("SYNC_CONFIG_PATH")
                .unwrap_or_else(|_| DEFAULT_SYNC_CONFIG_PATH.into())
                .into(),
            scheduler_tick: Duration::from_secs(env_parse("SCHEDULER_TICK_SECS", 60)),
            config_reload_interval: Duration::from_secs(env_parse("CONFIG_RELOAD_SECS", 300)),
            worker_max_parallel_runs: env_parse("WORKER_MAX_PARALLEL_RUNS", 4),
            worker_name: env::var("WORKER_NAME")
                .or_else(|_| env::var("HOSTNAME"))
                .unwrap_or_else(|_| "pulp-manager-worker".into()),
            task_poll_interval: Duration::from_secs(env_parse("TASK_POLL_INTERVAL_SECS", 10)),
            task_poll_failure_budget: env_parse("TASK_POLL_FAILURE_BUDGET", 5),
            sync_retry_attempts: env_parse("SYNC_RETRY_ATTEMPTS", 3),
            sync_retry_base: Duration::from_secs(env_parse("SYNC_RETRY_BASE_SECS", 2)),
            credential_timeout: Duration::from_secs(env_parse("CREDENTIAL_TIMEOUT_SECS", 10)),
            http_timeout: Duration::from_secs(env_parse("HTTP_TIMEOUT_SECS", 60)),
            queue_poll_interval: Duration::from_secs(env_parse("QUEUE_POLL_SECS", 5)),
            pulp_api_scheme: env::var("PULP_API_SCHEME").unwrap_or_else(|_| "https".into()),
            metrics_bind_address: env::var("METRICS_BIND_ADDRESS").ok(),
        })
    }
}

/// Read and parse an environment variable, falling back to `default` when it
/// is unset or malformed.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Ignoring malformed {}='{}', using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}
