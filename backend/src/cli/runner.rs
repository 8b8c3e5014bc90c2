//! Execution logic for the `pulp-manager` subcommands.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cli::{Cli, Command};
use crate::config::{Config, DEFAULT_SYNC_CONFIG_PATH};
use crate::db;
use crate::error::{AppError, Result};
use crate::services::concurrency_gate::ConcurrencyGate;
use crate::services::credential_service::EnvCredentialResolver;
use crate::services::fleet_config_service::{
    load_fleet_config, spawn_reloader, FleetConfig, TaskDefinition,
};
use crate::services::health_service::HealthService;
use crate::services::job_queue::{JobQueue, StoreQueue};
use crate::services::metrics_service;
use crate::services::pulp_client::PulpClient;
use crate::services::scheduler_service::{spawn_scheduler, SchedulerService};
use crate::services::store::postgres::PgStore;
use crate::services::store::SyncStore;
use crate::services::sync_worker::{spawn_sync_worker, SyncWorker, WorkerConfig};

const POOL_GAUGE_INTERVAL: Duration = Duration::from_secs(15);

/// Which long-running components a process hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    All,
    SchedulerOnly,
    WorkerOnly,
}

impl Mode {
    fn runs_scheduler(self) -> bool {
        self != Mode::WorkerOnly
    }

    fn runs_worker(self) -> bool {
        self != Mode::SchedulerOnly
    }
}

/// Run a parsed CLI command to completion.
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run => serve(cli.config, Mode::All).await,
        Command::Scheduler => serve(cli.config, Mode::SchedulerOnly).await,
        Command::Worker => serve(cli.config, Mode::WorkerOnly).await,
        Command::CheckConfig => check_config(cli.config),
        Command::Status { server, runs } => status(cli.config, &server, runs).await,
        Command::Sync { server, target } => {
            let task = target.task();
            enqueue(cli.config, |fleet| fleet.task_definition(&server, &task)).await
        }
        Command::RemoveRepos {
            server,
            regex_include,
            regex_exclude,
            execute,
        } => {
            enqueue(cli.config, |fleet| {
                fleet.removal_definition(
                    &server,
                    regex_include.as_deref(),
                    regex_exclude.as_deref(),
                    !execute,
                )
            })
            .await
        }
        Command::RemoveContent {
            server,
            repo,
            content_hrefs,
            force_publish,
        } => {
            enqueue(cli.config, |fleet| {
                fleet.remove_content_definition(&server, &repo, content_hrefs, force_publish)
            })
            .await
        }
    }
}

/// The config path from `--config`, else `SYNC_CONFIG_PATH`, else the default.
fn sync_config_path(cli_path: Option<PathBuf>) -> PathBuf {
    cli_path
        .or_else(|| std::env::var("SYNC_CONFIG_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SYNC_CONFIG_PATH))
}

fn load_config(cli_path: Option<PathBuf>) -> Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(path) = cli_path {
        config.sync_config_path = path;
    }
    Ok(config)
}

// ── check-config ────────────────────────────────────────────────────────────

fn check_config(cli_path: Option<PathBuf>) -> Result<()> {
    let path = sync_config_path(cli_path);
    let fleet = load_fleet_config(&path)?;

    let now = chrono::Utc::now();
    println!("{}: OK ({} servers)", path.display(), fleet.servers.len());
    for task in fleet.task_definitions() {
        let (schedule, next) = match &task.schedule {
            Some(s) => (
                s.expr().to_string(),
                s.next_after(now)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string()),
            ),
            None => ("ad-hoc".to_string(), "-".to_string()),
        };
        println!(
            "  {:<32} {:<36} {:<16} next={:<26} max_runtime={}",
            task.server,
            task.task.to_string(),
            schedule,
            next,
            humantime::format_duration(task.max_runtime)
        );
    }
    Ok(())
}

// ── status / ad-hoc runs ────────────────────────────────────────────────────

async fn status(cli_path: Option<PathBuf>, server: &str, runs: usize) -> Result<()> {
    let config = load_config(cli_path)?;
    let fleet = load_fleet_config(&config.sync_config_path)?;
    if fleet.server(server).is_none() {
        return Err(AppError::NotFound(format!("server {}", server)));
    }

    let pool = db::create_pool(&config).await?;
    let store: Arc<dyn SyncStore> = Arc::new(PgStore::new(pool.clone()));
    let health = HealthService::new(store).server_health(server, runs).await?;
    println!("{}", serde_json::to_string_pretty(&health)?);

    pool.close().await;
    Ok(())
}

/// Enqueue the task `build` picks out of the fleet config.
async fn enqueue<F>(cli_path: Option<PathBuf>, build: F) -> Result<()>
where
    F: FnOnce(&FleetConfig) -> Result<TaskDefinition>,
{
    let config = load_config(cli_path)?;
    let fleet = load_fleet_config(&config.sync_config_path)?;
    let definition = build(&fleet)?;
    let (server, task) = (definition.server.clone(), definition.task.clone());

    let pool = db::create_pool(&config).await?;
    let store: Arc<dyn SyncStore> = Arc::new(PgStore::new(pool.clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(StoreQueue::new(
        store.clone(),
        config.worker_name.clone(),
        config.queue_poll_interval,
    ));
    let (_fleet_tx, fleet_rx) = watch::channel(Arc::new(fleet));
    let scheduler = SchedulerService::new(store, queue, fleet_rx, config.scheduler_tick);

    match scheduler.enqueue_definition(definition).await? {
        Some(run) => println!("Enqueued job run {}", run.id),
        None => println!("A run of {} on {} is already active", task, server),
    }

    pool.close().await;
    Ok(())
}

// ── run / scheduler / worker ────────────────────────────────────────────────

async fn serve(cli_path: Option<PathBuf>, mode: Mode) -> Result<()> {
    let config = load_config(cli_path)?;
    tracing::info!("Starting Pulp Manager ({:?})", mode);

    if let Some(addr) = &config.metrics_bind_address {
        metrics_service::init_metrics(addr.parse()?)?;
    }

    let pool = db::create_pool(&config).await?;
    tracing::info!("Connected to database");
    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Database migrations complete");

    let store: Arc<dyn SyncStore> = Arc::new(PgStore::new(pool.clone()));
    let fleet = load_fleet_config(&config.sync_config_path)?;
    tracing::info!(
        "Loaded sync config from {} ({} servers)",
        config.sync_config_path.display(),
        fleet.servers.len()
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let (fleet_tx, fleet_rx) = watch::channel(Arc::new(fleet));
    let mut handles = vec![spawn_reloader(
        config.sync_config_path.clone(),
        config.config_reload_interval,
        fleet_tx,
        shutdown.clone(),
    )];
    handles.push(spawn_pool_gauges(pool.clone(), shutdown.clone()));

    let queue: Arc<dyn JobQueue> = Arc::new(StoreQueue::new(
        store.clone(),
        config.worker_name.clone(),
        config.queue_poll_interval,
    ));

    if mode.runs_scheduler() {
        let scheduler = Arc::new(SchedulerService::new(
            store.clone(),
            queue.clone(),
            fleet_rx.clone(),
            config.scheduler_tick,
        ));
        handles.push(spawn_scheduler(
            scheduler,
            config.scheduler_tick,
            shutdown.clone(),
        ));
    }

    if mode.runs_worker() {
        // Clients and credentials cover the servers known at startup.
        let fleet = fleet_rx.borrow().clone();
        let credentials = Arc::new(EnvCredentialResolver::from_fleet(&fleet));
        let client = Arc::new(PulpClient::new(&fleet, credentials, &config)?);
        let worker = Arc::new(SyncWorker::new(
            store.clone(),
            client,
            queue,
            Arc::new(ConcurrencyGate::new()),
            WorkerConfig::from_config(&config),
        ));
        handles.push(spawn_sync_worker(worker, shutdown.clone()));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!("Background task panicked: {}", e);
        }
    }

    pool.close().await;
    tracing::info!("Pulp Manager stopped");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Shutdown requested, waiting for in-flight runs to stop");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
                _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            tracing::warn!("Cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn spawn_pool_gauges(pool: sqlx::PgPool, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POOL_GAUGE_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => metrics_service::set_db_pool_gauges(&pool),
            }
        }
    })
}
