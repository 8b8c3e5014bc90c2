//! Postgres-backed store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::SyncStore;
use crate::error::{AppError, Result};
use crate::models::job_run::{JobRun, JobRunStatus, JobSpec, NewJobRun, TaskKind};
use crate::models::repo::{
    FailureReason, InventoryChange, RemoteRepo, Repo, RepoAttempt, RepoKind, RepoOutcome,
    SyncState,
};
use crate::models::transition::Transition;

// ── Internal row types ──────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct JobRunRow {
    id: Uuid,
    server_name: String,
    task: Json<TaskKind>,
    spec: Json<JobSpec>,
    status: JobRunStatus,
    scheduled_for: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    deadline: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    worker: Option<String>,
    error: Option<String>,
    repo_outcomes: Json<BTreeMap<String, RepoOutcome>>,
    created_at: DateTime<Utc>,
}

impl From<JobRunRow> for JobRun {
    fn from(row: JobRunRow) -> Self {
        JobRun {
            id: row.id,
            server_name: row.server_name,
            task: row.task.0,
            spec: row.spec.0,
            status: row.status,
            scheduled_for: row.scheduled_for,
            started_at: row.started_at,
            deadline: row.deadline,
            finished_at: row.finished_at,
            worker: row.worker,
            error: row.error,
            repo_outcomes: row.repo_outcomes.0,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RepoRow {
    server_name: String,
    name: String,
    href: String,
    kind: Option<Json<RepoKind>>,
    stale: bool,
    status: Option<SyncState>,
    generation: i64,
    last_sync_started_at: Option<DateTime<Utc>>,
    last_sync_ended_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_failure_reason: Option<FailureReason>,
}

impl From<RepoRow> for Repo {
    fn from(row: RepoRow) -> Self {
        Repo {
            server_name: row.server_name,
            name: row.name,
            href: row.href,
            kind: row.kind.map(|k| k.0),
            stale: row.stale,
            status: row.status,
            generation: row.generation,
            last_sync_started_at: row.last_sync_started_at,
            last_sync_ended_at: row.last_sync_ended_at,
            last_error: row.last_error,
            last_failure_reason: row.last_failure_reason,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AttemptRow {
    server_name: String,
    repo_name: String,
    generation: i64,
    job_run_id: Uuid,
    state: SyncState,
    reason: Option<FailureReason>,
    error: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl From<AttemptRow> for RepoAttempt {
    fn from(row: AttemptRow) -> Self {
        RepoAttempt {
            server_name: row.server_name,
            repo_name: row.repo_name,
            generation: row.generation,
            job_run_id: row.job_run_id,
            state: row.state,
            reason: row.reason,
            error: row.error,
            started_at: row.started_at,
            ended_at: row.ended_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransitionRow {
    from_state: SyncState,
    to_state: SyncState,
    at: DateTime<Utc>,
    reason: Option<FailureReason>,
    detail: Option<String>,
}

// ── Store ───────────────────────────────────────────────────────────────────

pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SyncStore for PgStore {
    async fn create_job_run_if_idle(&self, new: NewJobRun) -> Result<Option<JobRun>> {
        let row = sqlx::query_as::<_, JobRunRow>(
            r#"
            INSERT INTO job_runs (
                id, server_name, task_key, task, spec, status, scheduled_for, deadline
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7)
            ON CONFLICT (server_name, task_key) WHERE status IN ('pending', 'running')
            DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.server_name)
        .bind(new.task.task_key())
        .bind(Json(&new.task))
        .bind(Json(&new.spec))
        .bind(new.scheduled_for)
        .bind(new.deadline)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(JobRun::from))
    }

    async fn claim_next_pending(&self, worker: &str) -> Result<Option<JobRun>> {
        let row = sqlx::query_as::<_, JobRunRow>(
            r#"
            UPDATE job_runs
            SET status = 'running', worker = $1, started_at = COALESCE(started_at, NOW())
            WHERE id = (
                SELECT id FROM job_runs
                WHERE status = 'pending'
                ORDER BY scheduled_for, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(worker)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(JobRun::from))
    }

    async fn mark_job_run_running(&self, id: Uuid, worker: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET status = 'running', worker = $2, started_at = COALESCE(started_at, NOW())
            WHERE id = $1
              AND (status = 'pending' OR (status = 'running' AND worker = $2))
            "#,
        )
        .bind(id)
        .bind(worker)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_job_run(
        &self,
        id: Uuid,
        status: JobRunStatus,
        repo_outcomes: BTreeMap<String, RepoOutcome>,
        error: Option<String>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET status = $2, repo_outcomes = $3, error = $4, finished_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(Json(&repo_outcomes))
        .bind(error)
        .execute(&self.db)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM job_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(AppError::NotFound(format!("job run {}", id))),
        }
    }

    async fn active_job_runs(&self) -> Result<Vec<JobRun>> {
        let rows = sqlx::query_as::<_, JobRunRow>(
            "SELECT * FROM job_runs WHERE status IN ('pending', 'running') ORDER BY created_at",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(JobRun::from).collect())
    }

    async fn recent_job_runs(&self, server: &str, limit: usize) -> Result<Vec<JobRun>> {
        let rows = sqlx::query_as::<_, JobRunRow>(
            r#"
            SELECT * FROM job_runs
            WHERE server_name = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(server)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(JobRun::from).collect())
    }

    async fn get_job_run(&self, id: Uuid) -> Result<Option<JobRun>> {
        let row = sqlx::query_as::<_, JobRunRow>("SELECT * FROM job_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(row.map(JobRun::from))
    }

    async fn schedule_marker(
        &self,
        server: &str,
        task_key: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let marker = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT last_fired_at FROM schedule_markers WHERE server_name = $1 AND task_key = $2",
        )
        .bind(server)
        .bind(task_key)
        .fetch_optional(&self.db)
        .await?;

        Ok(marker)
    }

    async fn set_schedule_marker(
        &self,
        server: &str,
        task_key: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedule_markers (server_name, task_key, last_fired_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (server_name, task_key) DO UPDATE
            SET last_fired_at = GREATEST(schedule_markers.last_fired_at, EXCLUDED.last_fired_at)
            "#,
        )
        .bind(server)
        .bind(task_key)
        .bind(fired_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn sync_inventory(
        &self,
        server: &str,
        repos: &[RemoteRepo],
    ) -> Result<InventoryChange> {
        let mut change = InventoryChange::default();
        let mut tx = self.db.begin().await?;

        for remote in repos {
            let inserted = sqlx::query_scalar::<_, bool>(
                r#"
                INSERT INTO repos (server_name, name, href, kind, stale)
                VALUES ($1, $2, $3, $4, false)
                ON CONFLICT (server_name, name) DO UPDATE
                SET href = EXCLUDED.href, kind = EXCLUDED.kind, stale = false, updated_at = NOW()
                RETURNING (xmax = 0)
                "#,
            )
            .bind(server)
            .bind(&remote.name)
            .bind(&remote.href)
            .bind(Json(&remote.kind))
            .fetch_one(&mut *tx)
            .await?;
            if inserted {
                change.added.push(remote.name.clone());
            }
        }

        let reported: Vec<String> = repos.iter().map(|r| r.name.clone()).collect();
        change.marked_stale = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE repos SET stale = true, updated_at = NOW()
            WHERE server_name = $1 AND stale = false AND NOT (name = ANY($2))
            RETURNING name
            "#,
        )
        .bind(server)
        .bind(&reported)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(change)
    }

    async fn begin_repo_attempt(&self, server: &str, repo: &str, job_run_id: Uuid) -> Result<i64> {
        let mut tx = self.db.begin().await?;

        let generation = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO repos (server_name, name, generation, status, last_sync_started_at)
            VALUES ($1, $2, 1, 'pending', NOW())
            ON CONFLICT (server_name, name) DO UPDATE
            SET generation = repos.generation + 1,
                status = 'pending',
                last_sync_started_at = NOW(),
                updated_at = NOW()
            RETURNING generation
            "#,
        )
        .bind(server)
        .bind(repo)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO repo_attempts (server_name, repo_name, generation, job_run_id)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(server)
        .bind(repo)
        .bind(generation)
        .bind(job_run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(generation)
    }

    async fn update_repo_status(
        &self,
        server: &str,
        repo: &str,
        generation: i64,
        state: SyncState,
        reason: Option<FailureReason>,
        error: Option<String>,
    ) -> Result<bool> {
        let terminal = state.is_terminal();
        let mut tx = self.db.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE repos
            SET status = $4,
                last_sync_ended_at = CASE WHEN $5 THEN NOW() ELSE last_sync_ended_at END,
                last_failure_reason = CASE WHEN $5 THEN $6 ELSE last_failure_reason END,
                last_error = CASE WHEN $5 THEN $7 ELSE last_error END,
                updated_at = NOW()
            WHERE server_name = $1 AND name = $2 AND generation = $3
              AND (status IS NULL OR status NOT IN ('succeeded', 'failed', 'cancelled'))
            "#,
        )
        .bind(server)
        .bind(repo)
        .bind(generation)
        .bind(state)
        .bind(terminal)
        .bind(reason)
        .bind(&error)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE repo_attempts
            SET state = $4,
                reason = $5,
                error = $6,
                ended_at = CASE WHEN $7 THEN NOW() ELSE ended_at END
            WHERE server_name = $1 AND repo_name = $2 AND generation = $3
            "#,
        )
        .bind(server)
        .bind(repo)
        .bind(generation)
        .bind(state)
        .bind(reason)
        .bind(&error)
        .bind(terminal)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn record_transition(
        &self,
        server: &str,
        repo: &str,
        generation: i64,
        transition: &Transition,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO repo_transitions (
                server_name, repo_name, generation, from_state, to_state, reason, detail, at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(server)
        .bind(repo)
        .bind(generation)
        .bind(transition.from)
        .bind(transition.to)
        .bind(transition.reason)
        .bind(&transition.detail)
        .bind(transition.at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn transitions(
        &self,
        server: &str,
        repo: &str,
        generation: i64,
    ) -> Result<Vec<Transition>> {
        let rows = sqlx::query_as::<_, TransitionRow>(
            r#"
            SELECT from_state, to_state, at, reason, detail
            FROM repo_transitions
            WHERE server_name = $1 AND repo_name = $2 AND generation = $3
            ORDER BY id
            "#,
        )
        .bind(server)
        .bind(repo)
        .bind(generation)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Transition {
                from: row.from_state,
                to: row.to_state,
                at: row.at,
                reason: row.reason,
                detail: row.detail,
            })
            .collect())
    }

    async fn list_repos(&self, server: &str) -> Result<Vec<Repo>> {
        let rows =
            sqlx::query_as::<_, RepoRow>("SELECT * FROM repos WHERE server_name = $1 ORDER BY name")
                .bind(server)
                .fetch_all(&self.db)
                .await?;

        Ok(rows.into_iter().map(Repo::from).collect())
    }

    async fn repo_attempts(
        &self,
        server: &str,
        repo: &str,
        limit: usize,
    ) -> Result<Vec<RepoAttempt>> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT * FROM repo_attempts
            WHERE server_name = $1 AND repo_name = $2
            ORDER BY generation DESC
            LIMIT $3
            "#,
        )
        .bind(server)
        .bind(repo)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(RepoAttempt::from).collect())
    }

    async fn unfinished_attempts(&self, job_run_id: Uuid) -> Result<Vec<RepoAttempt>> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT * FROM repo_attempts
            WHERE job_run_id = $1
              AND state NOT IN ('succeeded', 'failed', 'cancelled')
            ORDER BY repo_name
            "#,
        )
        .bind(job_run_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(RepoAttempt::from).collect())
    }
}
