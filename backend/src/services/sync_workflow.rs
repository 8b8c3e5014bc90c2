//! Per-repo workflow state machine.
//!
//! `pending -> discovering -> syncing -> verifying -> succeeded`, with any
//! non-terminal state able to move to `failed` or `cancelled`. Kinds with
//! follow-up steps loop `verifying -> syncing -> verifying` once per step.
//! Every transition is written to the store against the attempt's
//! generation, so a superseded attempt can never overwrite a newer one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::remote_task::{Operation, RemoteTask, RemoteTaskHandle, StepStart};
use crate::models::repo::{FailureReason, RemoteRepo, RepoOutcome, SyncState};
use crate::models::transition::Transition;
use crate::services::concurrency_gate::{ConcurrencyGate, GateKey};
use crate::services::metrics_service;
use crate::services::pulp_client::RepoServerClient;
use crate::services::retry::{retry_remote, RetryError, RetryPolicy};
use crate::services::store::SyncStore;
use crate::services::task_monitor::{MonitorOutcome, TaskMonitor};

const REMOTE_CANCEL_TIMEOUT: Duration = Duration::from_secs(30);

/// One repo's share of a job run.
#[derive(Debug, Clone)]
pub struct RepoJob {
    pub job_run_id: Uuid,
    pub server: String,
    pub repo: RemoteRepo,
    pub operation: Operation,
    pub gate: GateKey,
    pub gate_limit: usize,
    /// The owning run's deadline.
    pub deadline: Instant,
}

/// Why the workflow stopped short of `succeeded`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Halt {
    Failed {
        reason: FailureReason,
        error: String,
    },
    Cancelled {
        open_task: Option<RemoteTaskHandle>,
    },
}

impl From<RetryError> for Halt {
    fn from(e: RetryError) -> Self {
        let message = e.to_string();
        match e {
            RetryError::Cancelled => Halt::Cancelled { open_task: None },
            RetryError::Failed { error, .. } => Halt::Failed {
                reason: if error.is_transient() {
                    FailureReason::Transient
                } else {
                    FailureReason::Permanent
                },
                error: message,
            },
        }
    }
}

/// Current attempt of one repo; writes every transition through.
struct Attempt<'a> {
    store: &'a dyn SyncStore,
    server: &'a str,
    repo: &'a str,
    generation: i64,
    state: SyncState,
}

impl Attempt<'_> {
    async fn transition(
        &mut self,
        to: SyncState,
        reason: Option<FailureReason>,
        detail: Option<String>,
    ) {
        let record = Transition {
            from: self.state,
            to,
            at: Utc::now(),
            reason,
            detail: detail.clone(),
        };
        let error = if to.is_terminal() { detail } else { None };

        match self
            .store
            .update_repo_status(self.server, self.repo, self.generation, to, reason, error)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    server = self.server,
                    repo = self.repo,
                    generation = self.generation,
                    "Attempt superseded or already finished, {} not recorded",
                    to
                );
                self.state = to;
                return;
            }
            Err(e) => tracing::warn!(
                server = self.server,
                repo = self.repo,
                "Failed to update repo status to {}: {}",
                to,
                e
            ),
        }
        if let Err(e) = self
            .store
            .record_transition(self.server, self.repo, self.generation, &record)
            .await
        {
            tracing::warn!(
                server = self.server,
                repo = self.repo,
                "Failed to record transition {} -> {}: {}",
                record.from,
                to,
                e
            );
        }

        tracing::debug!(
            server = self.server,
            repo = self.repo,
            generation = self.generation,
            "{} -> {}",
            self.state,
            to
        );
        self.state = to;
    }
}

pub struct SyncWorkflow {
    store: Arc<dyn SyncStore>,
    client: Arc<dyn RepoServerClient>,
    gate: Arc<ConcurrencyGate>,
    monitor: TaskMonitor,
    retry: RetryPolicy,
}

impl SyncWorkflow {
    pub fn new(
        store: Arc<dyn SyncStore>,
        client: Arc<dyn RepoServerClient>,
        gate: Arc<ConcurrencyGate>,
        monitor: TaskMonitor,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            client,
            gate,
            monitor,
            retry,
        }
    }

    /// Drive one repo to a terminal state. Never panics on remote or store
    /// errors; the outcome says what happened.
    pub async fn run(&self, job: &RepoJob, cancel: &CancellationToken) -> RepoOutcome {
        let generation = match self
            .store
            .begin_repo_attempt(&job.server, &job.repo.name, job.job_run_id)
            .await
        {
            Ok(generation) => generation,
            Err(e) => {
                tracing::error!(
                    server = %job.server,
                    repo = %job.repo.name,
                    "Failed to start repo attempt: {}",
                    e
                );
                return RepoOutcome::failed(
                    FailureReason::Transient,
                    format!("could not record attempt: {}", e),
                );
            }
        };

        let mut attempt = Attempt {
            store: self.store.as_ref(),
            server: &job.server,
            repo: &job.repo.name,
            generation,
            state: SyncState::Pending,
        };

        let outcome = match self.steps(&mut attempt, job, cancel).await {
            Ok(()) => {
                attempt.transition(SyncState::Succeeded, None, None).await;
                tracing::info!(
                    server = %job.server,
                    repo = %job.repo.name,
                    generation,
                    "Repo {} succeeded",
                    job.operation.label()
                );
                RepoOutcome::succeeded()
            }
            Err(Halt::Failed { reason, error }) => {
                tracing::warn!(
                    server = %job.server,
                    repo = %job.repo.name,
                    generation,
                    reason = %reason,
                    "Repo {} failed: {}",
                    job.operation.label(),
                    error
                );
                attempt
                    .transition(SyncState::Failed, Some(reason), Some(error.clone()))
                    .await;
                RepoOutcome::failed(reason, error)
            }
            Err(Halt::Cancelled { open_task }) => {
                // Only the deadline cancels; losing the worker fails the repo.
                let (state, reason, error) = if Instant::now() >= job.deadline {
                    (
                        SyncState::Cancelled,
                        FailureReason::DeadlineExceeded,
                        "job run deadline exceeded",
                    )
                } else {
                    (
                        SyncState::Failed,
                        FailureReason::WorkerLost,
                        "worker shutting down",
                    )
                };
                tracing::warn!(
                    server = %job.server,
                    repo = %job.repo.name,
                    generation,
                    "Repo {} stopped in {}: {}",
                    job.operation.label(),
                    attempt.state,
                    error
                );
                attempt
                    .transition(state, Some(reason), Some(error.to_string()))
                    .await;
                // The terminal state is on record before the server is asked
                // to cancel, so a slow cancel cannot delay it.
                if let Some(handle) = open_task {
                    self.cancel_remote(&job.server, &handle).await;
                }
                RepoOutcome {
                    state,
                    reason: Some(reason),
                    error: Some(error.to_string()),
                }
            }
        };

        metrics_service::record_repo_outcome(&job.server, &outcome);
        outcome
    }

    async fn steps(
        &self,
        attempt: &mut Attempt<'_>,
        job: &RepoJob,
        cancel: &CancellationToken,
    ) -> Result<(), Halt> {
        let _permit = self
            .gate
            .acquire(job.gate.clone(), job.gate_limit, cancel)
            .await
            .map_err(|_| Halt::Cancelled { open_task: None })?;

        // ── discovering ──
        checkpoint(cancel)?;
        attempt.transition(SyncState::Discovering, None, None).await;
        let state = retry_remote(&self.retry, cancel, || {
            self.client.describe_repo(&job.server, &job.repo)
        })
        .await?;

        let run_main_step = match &job.operation {
            Operation::Sync { .. } => {
                if !state.has_remote {
                    return Err(Halt::Failed {
                        reason: FailureReason::Permanent,
                        error: format!("repo {} has no remote to sync from", job.repo.name),
                    });
                }
                if job.repo.kind.capabilities().noop_short_circuit && state.content_current {
                    tracing::debug!(
                        server = %job.server,
                        repo = %job.repo.name,
                        "Content already current, skipping sync call"
                    );
                    false
                } else {
                    true
                }
            }
            Operation::Snapshot { .. } | Operation::RemoveContent { .. } => {
                if state.latest_version_href.is_none() {
                    return Err(Halt::Failed {
                        reason: FailureReason::Permanent,
                        error: format!(
                            "repo {} has no version for {}",
                            job.repo.name,
                            job.operation.label()
                        ),
                    });
                }
                true
            }
            Operation::Remove => true,
        };

        // ── syncing ──
        if run_main_step {
            checkpoint(cancel)?;
            attempt.transition(SyncState::Syncing, None, None).await;
            let start = retry_remote(&self.retry, cancel, || {
                self.client.trigger(&job.server, &job.repo, &job.operation)
            })
            .await?;
            if let StepStart::Task(handle) = start {
                self.await_task(job, handle, cancel).await?;
            }
        }

        // ── verifying ──
        checkpoint(cancel)?;
        attempt.transition(SyncState::Verifying, None, None).await;
        for step in job.operation.follow_up_steps(&job.repo.kind) {
            checkpoint(cancel)?;
            let start = retry_remote(&self.retry, cancel, || {
                self.client
                    .start_follow_up(&job.server, &job.repo, &job.operation, step)
            })
            .await?;
            if let StepStart::Task(handle) = start {
                attempt
                    .transition(SyncState::Syncing, None, Some(format!("{:?}", step)))
                    .await;
                self.await_task(job, handle, cancel).await?;
                checkpoint(cancel)?;
                attempt.transition(SyncState::Verifying, None, None).await;
            }
        }

        checkpoint(cancel)
    }

    async fn await_task(
        &self,
        job: &RepoJob,
        handle: RemoteTaskHandle,
        cancel: &CancellationToken,
    ) -> Result<(), Halt> {
        let mut task = RemoteTask::new(handle);
        let remaining = job.deadline.saturating_duration_since(Instant::now());

        match self
            .monitor
            .wait(&job.server, &mut task, Some(remaining), cancel)
            .await
        {
            MonitorOutcome::Succeeded { created_resources } => {
                if !created_resources.is_empty() {
                    tracing::debug!(
                        server = %job.server,
                        repo = %job.repo.name,
                        "Task {} created {:?}",
                        task.handle,
                        created_resources
                    );
                }
                Ok(())
            }
            MonitorOutcome::Failed { error } => Err(Halt::Failed {
                reason: FailureReason::RemoteTask,
                error,
            }),
            MonitorOutcome::MonitorFailed { error } => Err(Halt::Failed {
                reason: FailureReason::Monitor,
                error,
            }),
            MonitorOutcome::TimedOut | MonitorOutcome::Cancelled => Err(Halt::Cancelled {
                open_task: Some(task.handle),
            }),
        }
    }

    /// Ask the server to cancel `handle`, once, without waiting long.
    async fn cancel_remote(&self, server: &str, handle: &RemoteTaskHandle) {
        match tokio::time::timeout(REMOTE_CANCEL_TIMEOUT, self.client.cancel_task(server, handle))
            .await
        {
            Ok(Ok(())) => tracing::info!(server, task = %handle, "Cancelled remote task"),
            Ok(Err(e)) => {
                tracing::warn!(server, task = %handle, "Failed to cancel remote task: {}", e)
            }
            Err(_) => tracing::warn!(server, task = %handle, "Timed out cancelling remote task"),
        }
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), Halt> {
    if cancel.is_cancelled() {
        Err(Halt::Cancelled { open_task: None })
    } else {
        Ok(())
    }
}
