//! Durable store for job runs, repo status and schedule markers.
//!
//! Every mutation touches a single record. The only compound operation is
//! [`SyncStore::create_job_run_if_idle`], which enforces at most one active
//! run per `(server, task)` atomically.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::job_run::{JobRun, JobRunStatus, NewJobRun};
use crate::models::repo::{
    FailureReason, InventoryChange, RemoteRepo, Repo, RepoAttempt, RepoOutcome, SyncState,
};
use crate::models::transition::Transition;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait SyncStore: Send + Sync {
    // ── Job runs ──

    /// Create a pending run unless one is already pending or running for
    /// the same `(server, task_key)`. Returns `None` when skipped.
    async fn create_job_run_if_idle(&self, new: NewJobRun) -> Result<Option<JobRun>>;

    /// Claim the oldest pending run for `worker`, marking it running.
    async fn claim_next_pending(&self, worker: &str) -> Result<Option<JobRun>>;

    /// Move a pending run to running under `worker`. Returns false when the
    /// run is finished or owned by a different worker.
    async fn mark_job_run_running(&self, id: Uuid, worker: &str) -> Result<bool>;

    /// Record a run's final status. Returns false, changing nothing, when
    /// the run was already finished (e.g. by stale-run reconciliation).
    async fn finish_job_run(
        &self,
        id: Uuid,
        status: JobRunStatus,
        repo_outcomes: BTreeMap<String, RepoOutcome>,
        error: Option<String>,
    ) -> Result<bool>;

    /// Pending and running runs across all servers.
    async fn active_job_runs(&self) -> Result<Vec<JobRun>>;

    /// Most recent runs for a server, newest first.
    async fn recent_job_runs(&self, server: &str, limit: usize) -> Result<Vec<JobRun>>;

    async fn get_job_run(&self, id: Uuid) -> Result<Option<JobRun>>;

    // ── Schedule markers ──

    async fn schedule_marker(&self, server: &str, task_key: &str)
        -> Result<Option<DateTime<Utc>>>;

    async fn set_schedule_marker(
        &self,
        server: &str,
        task_key: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<()>;

    // ── Repos ──

    /// Upsert the repos a server reports and mark the rest stale.
    async fn sync_inventory(&self, server: &str, repos: &[RemoteRepo])
        -> Result<InventoryChange>;

    /// Start a new attempt for a repo and return its generation.
    async fn begin_repo_attempt(&self, server: &str, repo: &str, job_run_id: Uuid)
        -> Result<i64>;

    /// Update a repo's status for `generation`. Returns false, changing
    /// nothing, when a newer attempt has started since or the attempt has
    /// already reached a terminal state.
    async fn update_repo_status(
        &self,
        server: &str,
        repo: &str,
        generation: i64,
        state: SyncState,
        reason: Option<FailureReason>,
        error: Option<String>,
    ) -> Result<bool>;

    async fn record_transition(
        &self,
        server: &str,
        repo: &str,
        generation: i64,
        transition: &Transition,
    ) -> Result<()>;

    async fn transitions(&self, server: &str, repo: &str, generation: i64)
        -> Result<Vec<Transition>>;

    async fn list_repos(&self, server: &str) -> Result<Vec<Repo>>;

    /// Attempts for a repo, newest first.
    async fn repo_attempts(&self, server: &str, repo: &str, limit: usize)
        -> Result<Vec<RepoAttempt>>;

    /// Attempts of a run that never reached a terminal state.
    async fn unfinished_attempts(&self, job_run_id: Uuid) -> Result<Vec<RepoAttempt>>;
}
