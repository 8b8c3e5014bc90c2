//! Worker dispatch loop.
//!
//! Takes job runs off the queue, expands each into one workflow per selected
//! repo and runs them in parallel under the concurrency gate. Every run gets
//! a cancellation token that fires at its deadline or on shutdown.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::job_run::{JobRun, JobRunStatus, TaskKind};
use crate::models::remote_task::{BannedPackages, Operation};
use crate::models::repo::{FailureReason, RemoteRepo, RepoOutcome, SyncState};
use crate::models::transition::Transition;
use crate::services::concurrency_gate::{ConcurrencyGate, GateKey};
use crate::services::job_queue::JobQueue;
use crate::services::metrics_service;
use crate::services::pulp_client::RepoServerClient;
use crate::services::repo_selector_service::RepoSelector;
use crate::services::retry::{retry_remote, RetryError, RetryPolicy};
use crate::services::store::SyncStore;
use crate::services::sync_workflow::{RepoJob, SyncWorkflow};
use crate::services::task_monitor::{MonitorConfig, TaskMonitor};

const DEFAULT_SNAPSHOT_PREFIX: &str = "snap";
const WORKER_LOST: &str = "worker lost before the run finished";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Recorded against every run this worker executes.
    pub name: String,
    pub max_parallel_runs: usize,
    pub retry: RetryPolicy,
    pub monitor: MonitorConfig,
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            name: config.worker_name.clone(),
            max_parallel_runs: config.worker_max_parallel_runs.max(1),
            retry: RetryPolicy {
                attempts: config.sync_retry_attempts,
                base: config.sync_retry_base,
                ..RetryPolicy::default()
            },
            monitor: MonitorConfig {
                poll_interval: config.task_poll_interval,
                failure_budget: config.task_poll_failure_budget,
                ..MonitorConfig::default()
            },
        }
    }
}

/// How a run breaks down before any workflow starts.
enum Expansion {
    Workflows(Vec<RepoJob>),
    /// The run's work finished during expansion.
    Done(BTreeMap<String, RepoOutcome>),
}

pub struct SyncWorker {
    store: Arc<dyn SyncStore>,
    client: Arc<dyn RepoServerClient>,
    queue: Arc<dyn JobQueue>,
    gate: Arc<ConcurrencyGate>,
    config: WorkerConfig,
}

impl SyncWorker {
    pub fn new(
        store: Arc<dyn SyncStore>,
        client: Arc<dyn RepoServerClient>,
        queue: Arc<dyn JobQueue>,
        gate: Arc<ConcurrencyGate>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            client,
            queue,
            gate,
            config,
        }
    }

    // ── Reconciliation ──────────────────────────────────────────────────────

    /// Close out runs a dead worker left behind.
    ///
    /// Running runs past their deadline are failed and their unfinished
    /// repos marked `failed` (worker lost); pending runs past their deadline
    /// are cancelled. Returns the number of runs closed.
    pub async fn reconcile_stale_runs(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut closed = 0;
        for run in self.store.active_job_runs().await? {
            if run.deadline > now {
                continue;
            }
            match run.status {
                JobRunStatus::Running => {
                    let mut outcomes = run.repo_outcomes.clone();
                    for attempt in self.store.unfinished_attempts(run.id).await? {
                        let updated = self
                            .store
                            .update_repo_status(
                                &attempt.server_name,
                                &attempt.repo_name,
                                attempt.generation,
                                SyncState::Failed,
                                Some(FailureReason::WorkerLost),
                                Some(WORKER_LOST.to_string()),
                            )
                            .await?;
                        if updated {
                            let transition = Transition {
                                from: attempt.state,
                                to: SyncState::Failed,
                                at: now,
                                reason: Some(FailureReason::WorkerLost),
                                detail: Some(WORKER_LOST.to_string()),
                            };
                            self.store
                                .record_transition(
                                    &attempt.server_name,
                                    &attempt.repo_name,
                                    attempt.generation,
                                    &transition,
                                )
                                .await?;
                        }
                        outcomes.insert(
                            attempt.repo_name.clone(),
                            RepoOutcome::failed(FailureReason::WorkerLost, WORKER_LOST),
                        );
                    }
                    tracing::warn!(
                        server = %run.server_name,
                        job_run_id = %run.id,
                        "Reconciled stale {} run left by worker {:?}",
                        run.task,
                        run.worker
                    );
                    self.store
                        .finish_job_run(
                            run.id,
                            JobRunStatus::Failed,
                            outcomes,
                            Some(WORKER_LOST.to_string()),
                        )
                        .await?;
                }
                JobRunStatus::Pending => {
                    tracing::warn!(
                        server = %run.server_name,
                        job_run_id = %run.id,
                        "Cancelling {} run whose deadline passed before it started",
                        run.task
                    );
                    self.store
                        .finish_job_run(
                            run.id,
                            JobRunStatus::CancelledTimeout,
                            BTreeMap::new(),
                            Some("deadline passed before the run started".to_string()),
                        )
                        .await?;
                }
                _ => continue,
            }
            closed += 1;
        }
        Ok(closed)
    }

    // ── Dispatch loop ───────────────────────────────────────────────────────

    /// Pop and execute runs until `shutdown` fires, then wait for in-flight
    /// runs to wind down.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let slots = Arc::new(Semaphore::new(self.config.max_parallel_runs.max(1)));
        let mut runs = JoinSet::new();
        tracing::info!(
            "Worker '{}' started ({} parallel runs)",
            self.config.name,
            self.config.max_parallel_runs
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let Some(run) = self.queue.pop(&shutdown).await else {
                break;
            };

            let worker = self.clone();
            let shutdown = shutdown.clone();
            runs.spawn(async move {
                let _permit = permit;
                worker.execute_job_run(run, &shutdown).await;
            });

            while let Some(done) = runs.try_join_next() {
                if let Err(e) = done {
                    tracing::error!("Job run task aborted: {}", e);
                }
            }
        }

        while let Some(done) = runs.join_next().await {
            if let Err(e) = done {
                tracing::error!("Job run task aborted: {}", e);
            }
        }
        tracing::info!("Worker '{}' stopped", self.config.name);
    }

    /// Execute one run end to end. Returns `None` when the run was already
    /// taken by another worker or finished.
    pub async fn execute_job_run(
        &self,
        mut run: JobRun,
        shutdown: &CancellationToken,
    ) -> Option<JobRunStatus> {
        match self
            .store
            .mark_job_run_running(run.id, &self.config.name)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(job_run_id = %run.id, "Job run no longer claimable, skipping");
                return None;
            }
            Err(e) => {
                tracing::error!(job_run_id = %run.id, "Failed to mark job run running: {}", e);
                return None;
            }
        }
        if run.started_at.is_none() {
            run.started_at = Some(Utc::now());
        }

        let deadline = instant_for(run.deadline);
        let cancel = shutdown.child_token();
        let _cancel_on_exit = cancel.clone().drop_guard();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sleep_until(deadline) => cancel.cancel(),
                }
            });
        }

        tracing::info!(
            server = %run.server_name,
            job_run_id = %run.id,
            "Starting {} (deadline {})",
            run.task,
            run.deadline
        );

        let (status, outcomes, error) = match self.expand(&run, deadline, &cancel).await {
            Ok(Expansion::Workflows(jobs)) => {
                let outcomes = self.run_workflows(&run, jobs, &cancel).await;
                if run.task == TaskKind::RepoRemoval {
                    // Removed repos drop out of the inventory as stale.
                    if let Err(e) = self.refresh_inventory(&run.server_name, &cancel).await {
                        tracing::warn!(
                            server = %run.server_name,
                            "Could not refresh inventory after removal: {}",
                            e
                        );
                    }
                }
                let status = aggregate_outcome(&outcomes);
                let error = summarize(status, &outcomes);
                (status, outcomes, error)
            }
            Ok(Expansion::Done(outcomes)) => {
                let status = aggregate_outcome(&outcomes);
                let error = summarize(status, &outcomes);
                (status, outcomes, error)
            }
            Err(e) => {
                let status = if Instant::now() >= deadline {
                    JobRunStatus::CancelledTimeout
                } else {
                    JobRunStatus::Failed
                };
                tracing::error!(
                    server = %run.server_name,
                    job_run_id = %run.id,
                    "{} could not start: {}",
                    run.task,
                    e
                );
                (status, BTreeMap::new(), Some(e.to_string()))
            }
        };

        match self
            .store
            .finish_job_run(run.id, status, outcomes, error)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                job_run_id = %run.id,
                "Job run already finished elsewhere, keeping its recorded status"
            ),
            Err(e) => tracing::error!(job_run_id = %run.id, "Failed to finish job run: {}", e),
        }
        metrics_service::record_job_run(&run, status, Utc::now());
        tracing::info!(
            server = %run.server_name,
            job_run_id = %run.id,
            "Finished {}: {}",
            run.task,
            status
        );
        Some(status)
    }

    // ── Expansion ───────────────────────────────────────────────────────────

    async fn expand(
        &self,
        run: &JobRun,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Expansion> {
        let server = run.server_name.as_str();
        let spec = &run.spec;
        let selector = RepoSelector::from_patterns(
            spec.regex_include.as_deref(),
            spec.regex_exclude.as_deref(),
        )?;

        match &run.task {
            TaskKind::RepoGroupSync { group } => {
                if let Some(upstream) = &spec.upstream {
                    if let Err(e) = self
                        .register_mirrors(server, upstream, &selector, true, cancel)
                        .await
                    {
                        tracing::warn!(
                            server,
                            "Could not register mirrors from {} before sync: {}",
                            upstream,
                            e
                        );
                    }
                }

                let banned_packages = spec.banned_package_regex.as_ref().map(|regex| {
                    BannedPackages {
                        regex: regex.clone(),
                        internal_domains: spec.internal_domains.clone(),
                    }
                });
                let repos = self.refresh_inventory(server, cancel).await?;
                let jobs = select_repos(&selector, repos)
                    .into_iter()
                    .map(|repo| RepoJob {
                        job_run_id: run.id,
                        server: server.to_string(),
                        repo,
                        operation: Operation::Sync {
                            options: spec.sync_options.clone(),
                            banned_packages: banned_packages.clone(),
                        },
                        gate: GateKey::sync(server, group),
                        gate_limit: spec.max_concurrent,
                        deadline,
                    })
                    .collect();
                Ok(Expansion::Workflows(jobs))
            }

            TaskKind::ConfigRegistration => {
                let mut outcomes = BTreeMap::new();
                if let Some(upstream) = &spec.upstream {
                    outcomes = self
                        .register_mirrors(server, upstream, &selector, false, cancel)
                        .await?;
                }
                self.refresh_inventory(server, cancel).await?;
                Ok(Expansion::Done(outcomes))
            }

            TaskKind::Snapshot => {
                let prefix = spec
                    .snapshot_prefix
                    .as_deref()
                    .unwrap_or(DEFAULT_SNAPSHOT_PREFIX);
                let repos = self.refresh_inventory(server, cancel).await?;

                let marker = format!("{}-", prefix);
                if let Some(existing) = repos.iter().find(|r| r.name.starts_with(&marker)) {
                    return Err(AppError::Conflict(format!(
                        "snapshot repos with prefix '{}' already exist on {} (e.g. {})",
                        prefix, server, existing.name
                    )));
                }

                let jobs = select_repos(&selector, repos)
                    .into_iter()
                    .filter(|repo| {
                        let supported = repo.kind.capabilities().snapshot;
                        if !supported {
                            tracing::debug!(
                                server,
                                repo = %repo.name,
                                "Skipping snapshot of unsupported kind {}",
                                repo.kind
                            );
                        }
                        supported
                    })
                    .map(|repo| RepoJob {
                        job_run_id: run.id,
                        server: server.to_string(),
                        operation: Operation::Snapshot {
                            name: format!("{}{}", marker, repo.name),
                        },
                        repo,
                        gate: GateKey::snapshot(server),
                        gate_limit: spec.max_concurrent,
                        deadline,
                    })
                    .collect();
                Ok(Expansion::Workflows(jobs))
            }

            TaskKind::RepoRemoval => {
                if spec.regex_include.is_none() && spec.regex_exclude.is_none() {
                    return Err(AppError::Validation(
                        "repo removal needs regex_include or regex_exclude".to_string(),
                    ));
                }
                let repos = self.refresh_inventory(server, cancel).await?;
                let selected = select_repos(&selector, repos);
                if selected.is_empty() {
                    return Err(AppError::NotFound(format!(
                        "no repos on {} match the removal patterns",
                        server
                    )));
                }
                tracing::info!(
                    server,
                    "{}Removing {} repos: {}",
                    if spec.dry_run { "Dry run: " } else { "" },
                    selected.len(),
                    selected
                        .iter()
                        .map(|r| r.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                if spec.dry_run {
                    return Ok(Expansion::Done(
                        selected
                            .into_iter()
                            .map(|repo| (repo.name, RepoOutcome::succeeded()))
                            .collect(),
                    ));
                }

                let jobs = selected
                    .into_iter()
                    .map(|repo| RepoJob {
                        job_run_id: run.id,
                        server: server.to_string(),
                        repo,
                        operation: Operation::Remove,
                        gate: GateKey::sync(server, "repo_removal"),
                        gate_limit: spec.max_concurrent,
                        deadline,
                    })
                    .collect();
                Ok(Expansion::Workflows(jobs))
            }

            TaskKind::RemoveContent { repo } => {
                let target = self
                    .refresh_inventory(server, cancel)
                    .await?
                    .into_iter()
                    .find(|r| &r.name == repo)
                    .ok_or_else(|| AppError::NotFound(format!("repo {} on {}", repo, server)))?;
                Ok(Expansion::Workflows(vec![RepoJob {
                    job_run_id: run.id,
                    server: server.to_string(),
                    repo: target,
                    operation: Operation::RemoveContent {
                        content_hrefs: spec.content_hrefs.clone(),
                        force_publish: spec.force_publish,
                    },
                    gate: GateKey::sync(server, run.task.task_key()),
                    gate_limit: 1,
                    deadline,
                }]))
            }
        }
    }

    async fn list_repos(&self, server: &str, cancel: &CancellationToken) -> Result<Vec<RemoteRepo>> {
        retry_remote(&self.config.retry, cancel, || self.client.list_repos(server))
            .await
            .map_err(|e| match e {
                RetryError::Failed { error, .. } => AppError::Remote(error),
                RetryError::Cancelled => {
                    AppError::Internal(format!("listing repos on {} was cancelled", server))
                }
            })
    }

    /// List the server's repos and record them as its inventory.
    async fn refresh_inventory(
        &self,
        server: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemoteRepo>> {
        let repos = self.list_repos(server, cancel).await?;
        let change = self.store.sync_inventory(server, &repos).await?;
        if !change.added.is_empty() || !change.marked_stale.is_empty() {
            tracing::info!(
                server,
                "Inventory: {} repos, {} new, {} stale",
                repos.len(),
                change.added.len(),
                change.marked_stale.len()
            );
        }
        Ok(repos)
    }

    /// Register mirrors of `upstream`'s selected repos on `server`. With
    /// `only_missing`, repos the server already has are left alone.
    async fn register_mirrors(
        &self,
        server: &str,
        upstream: &str,
        selector: &RepoSelector,
        only_missing: bool,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, RepoOutcome>> {
        let primary_repos = self.list_repos(upstream, cancel).await?;
        let existing: HashSet<String> = if only_missing {
            self.list_repos(server, cancel)
                .await?
                .into_iter()
                .map(|r| r.name)
                .collect()
        } else {
            HashSet::new()
        };

        let mut outcomes = BTreeMap::new();
        for repo in select_repos(selector, primary_repos) {
            if existing.contains(&repo.name) {
                continue;
            }
            if cancel.is_cancelled() {
                break;
            }
            let registered = retry_remote(&self.config.retry, cancel, || {
                self.client.register_mirror(server, upstream, &repo)
            })
            .await;
            let outcome = match registered {
                Ok(()) => {
                    tracing::debug!(server, repo = %repo.name, "Registered mirror of {}", upstream);
                    RepoOutcome::succeeded()
                }
                Err(RetryError::Failed { error, attempts }) => {
                    tracing::warn!(
                        server,
                        repo = %repo.name,
                        "Failed to register mirror after {} attempts: {}",
                        attempts,
                        error
                    );
                    let reason = if error.is_transient() {
                        FailureReason::Transient
                    } else {
                        FailureReason::Permanent
                    };
                    RepoOutcome::failed(reason, error.to_string())
                }
                Err(RetryError::Cancelled) => break,
            };
            outcomes.insert(repo.name.clone(), outcome);
        }
        Ok(outcomes)
    }

    // ── Execution ───────────────────────────────────────────────────────────

    async fn run_workflows(
        &self,
        run: &JobRun,
        jobs: Vec<RepoJob>,
        cancel: &CancellationToken,
    ) -> BTreeMap<String, RepoOutcome> {
        let total = jobs.len();
        let names: Vec<String> = jobs.iter().map(|j| j.repo.name.clone()).collect();
        let workflow = Arc::new(SyncWorkflow::new(
            self.store.clone(),
            self.client.clone(),
            self.gate.clone(),
            TaskMonitor::new(self.client.clone(), self.config.monitor),
            self.config.retry,
        ));

        let mut set = JoinSet::new();
        for job in jobs {
            let workflow = workflow.clone();
            let cancel = cancel.clone();
            let span = tracing::info_span!(
                "repo_workflow",
                server = %job.server,
                repo = %job.repo.name,
                job_run_id = %job.job_run_id
            );
            set.spawn(
                async move {
                    let outcome = workflow.run(&job, &cancel).await;
                    (job.repo.name, outcome)
                }
                .instrument(span),
            );
        }

        let mut outcomes = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, outcome)) => {
                    outcomes.insert(name, outcome);
                }
                Err(e) => tracing::error!(job_run_id = %run.id, "Repo workflow aborted: {}", e),
            }
            tracing::info!(
                server = %run.server_name,
                job_run_id = %run.id,
                "{}: {} in progress, {}/{} completed",
                run.task,
                set.len(),
                outcomes.len(),
                total
            );
        }

        for name in names {
            outcomes.entry(name).or_insert_with(|| {
                RepoOutcome::failed(FailureReason::Transient, "workflow aborted unexpectedly")
            });
        }
        outcomes
    }
}

/// Run the worker loop after reconciling stale runs.
pub fn spawn_sync_worker(
    worker: Arc<SyncWorker>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match worker.reconcile_stale_runs(Utc::now()).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Reconciled {} stale job runs", n),
            Err(e) => tracing::warn!("Stale run reconciliation failed: {}", e),
        }
        worker.run(shutdown).await;
    })
}

// ── Pure helper functions ───────────────────────────────────────────────────

/// Selected repos in the selector's order.
fn select_repos(selector: &RepoSelector, repos: Vec<RemoteRepo>) -> Vec<RemoteRepo> {
    let names: Vec<&str> = repos.iter().map(|r| r.name.as_str()).collect();
    let selected = selector.select(names.as_slice());
    let mut by_name: BTreeMap<String, RemoteRepo> =
        repos.into_iter().map(|r| (r.name.clone(), r)).collect();
    selected
        .into_iter()
        .filter_map(|name| by_name.remove(&name))
        .collect()
}

/// Run status from its repo outcomes: succeeded only if every repo
/// succeeded, cancelled-timeout if the deadline cut any repo short.
pub fn aggregate_outcome(outcomes: &BTreeMap<String, RepoOutcome>) -> JobRunStatus {
    if outcomes.values().all(|o| o.state == SyncState::Succeeded) {
        JobRunStatus::Succeeded
    } else if outcomes
        .values()
        .any(|o| o.reason == Some(FailureReason::DeadlineExceeded))
    {
        JobRunStatus::CancelledTimeout
    } else {
        JobRunStatus::Failed
    }
}

fn summarize(status: JobRunStatus, outcomes: &BTreeMap<String, RepoOutcome>) -> Option<String> {
    let unfinished = outcomes
        .values()
        .filter(|o| o.state != SyncState::Succeeded)
        .count();
    match status {
        JobRunStatus::Succeeded => None,
        JobRunStatus::CancelledTimeout => Some(format!(
            "deadline exceeded, {} of {} repos did not succeed",
            unfinished,
            outcomes.len()
        )),
        _ => Some(format!("{} of {} repos failed", unfinished, outcomes.len())),
    }
}

/// Tokio instant for a wall-clock deadline; past deadlines map to now.
pub fn instant_for(deadline: DateTime<Utc>) -> Instant {
    let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + remaining
}
