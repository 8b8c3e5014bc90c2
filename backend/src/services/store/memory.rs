//! In-process store with the same semantics as the Postgres store.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::SyncStore;
use crate::error::{AppError, Result};
use crate::models::job_run::{JobRun, JobRunStatus, NewJobRun};
use crate::models::repo::{
    FailureReason, InventoryChange, RemoteRepo, Repo, RepoAttempt, RepoOutcome, SyncState,
};
use crate::models::transition::Transition;

type RepoKey = (String, String);
type AttemptKey = (String, String, i64);

#[derive(Default)]
struct Inner {
    /// Creation order.
    job_runs: Vec<JobRun>,
    markers: HashMap<(String, String), DateTime<Utc>>,
    repos: BTreeMap<RepoKey, Repo>,
    attempts: BTreeMap<AttemptKey, RepoAttempt>,
    transitions: HashMap<AttemptKey, Vec<Transition>>,
}

impl Inner {
    fn job_run_mut(&mut self, id: Uuid) -> Result<&mut JobRun> {
        self.job_runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| AppError::NotFound(format!("job run {}", id)))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn empty_repo(server: &str, name: &str) -> Repo {
    Repo {
        server_name: server.to_string(),
        name: name.to_string(),
        href: String::new(),
        kind: None,
        stale: false,
        status: None,
        generation: 0,
        last_sync_started_at: None,
        last_sync_ended_at: None,
        last_error: None,
        last_failure_reason: None,
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn create_job_run_if_idle(&self, new: NewJobRun) -> Result<Option<JobRun>> {
        let mut inner = self.inner.lock().await;
        let task_key = new.task.task_key();
        let busy = inner.job_runs.iter().any(|r| {
            r.server_name == new.server_name && r.task_key() == task_key && r.status.is_active()
        });
        if busy {
            return Ok(None);
        }

        let run = JobRun {
            id: Uuid::new_v4(),
            server_name: new.server_name,
            task: new.task,
            spec: new.spec,
            status: JobRunStatus::Pending,
            scheduled_for: new.scheduled_for,
            started_at: None,
            deadline: new.deadline,
            finished_at: None,
            worker: None,
            error: None,
            repo_outcomes: BTreeMap::new(),
            created_at: Utc::now(),
        };
        inner.job_runs.push(run.clone());
        Ok(Some(run))
    }

    async fn claim_next_pending(&self, worker: &str) -> Result<Option<JobRun>> {
        let mut inner = self.inner.lock().await;
        let next = inner
            .job_runs
            .iter_mut()
            .filter(|r| r.status == JobRunStatus::Pending)
            .min_by_key(|r| r.scheduled_for);
        Ok(next.map(|run| {
            run.status = JobRunStatus::Running;
            run.worker = Some(worker.to_string());
            if run.started_at.is_none() {
                run.started_at = Some(Utc::now());
            }
            run.clone()
        }))
    }

    async fn mark_job_run_running(&self, id: Uuid, worker: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let run = inner.job_run_mut(id)?;
        match run.status {
            JobRunStatus::Pending => {
                run.status = JobRunStatus::Running;
                run.worker = Some(worker.to_string());
                if run.started_at.is_none() {
                    run.started_at = Some(Utc::now());
                }
                Ok(true)
            }
            JobRunStatus::Running => Ok(run.worker.as_deref() == Some(worker)),
            _ => Ok(false),
        }
    }

    async fn finish_job_run(
        &self,
        id: Uuid,
        status: JobRunStatus,
        repo_outcomes: BTreeMap<String, RepoOutcome>,
        error: Option<String>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let run = inner.job_run_mut(id)?;
        if !run.status.is_active() {
            return Ok(false);
        }
        run.status = status;
        run.repo_outcomes = repo_outcomes;
        run.error = error;
        run.finished_at = Some(Utc::now());
        Ok(true)
    }

    async fn active_job_runs(&self) -> Result<Vec<JobRun>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .job_runs
            .iter()
            .filter(|r| r.status.is_active())
            .cloned()
            .collect())
    }

    async fn recent_job_runs(&self, server: &str, limit: usize) -> Result<Vec<JobRun>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .job_runs
            .iter()
            .rev()
            .filter(|r| r.server_name == server)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_job_run(&self, id: Uuid) -> Result<Option<JobRun>> {
        let inner = self.inner.lock().await;
        Ok(inner.job_runs.iter().find(|r| r.id == id).cloned())
    }

    async fn schedule_marker(
        &self,
        server: &str,
        task_key: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .markers
            .get(&(server.to_string(), task_key.to_string()))
            .copied())
    }

    async fn set_schedule_marker(
        &self,
        server: &str,
        task_key: &str,
        fired_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let marker = inner
            .markers
            .entry((server.to_string(), task_key.to_string()))
            .or_insert(fired_at);
        // Markers only move forward.
        if fired_at > *marker {
            *marker = fired_at;
        }
        Ok(())
    }

    async fn sync_inventory(
        &self,
        server: &str,
        repos: &[RemoteRepo],
    ) -> Result<InventoryChange> {
        let mut inner = self.inner.lock().await;
        let mut change = InventoryChange::default();
        let reported: BTreeSet<&str> = repos.iter().map(|r| r.name.as_str()).collect();

        for remote in repos {
            let key = (server.to_string(), remote.name.clone());
            let repo = inner.repos.entry(key).or_insert_with(|| {
                change.added.push(remote.name.clone());
                empty_repo(server, &remote.name)
            });
            repo.href = remote.href.clone();
            repo.kind = Some(remote.kind.clone());
            repo.stale = false;
        }

        for ((repo_server, name), repo) in inner.repos.iter_mut() {
            if repo_server == server && !reported.contains(name.as_str()) && !repo.stale {
                repo.stale = true;
                change.marked_stale.push(name.clone());
            }
        }
        Ok(change)
    }

    async fn begin_repo_attempt(&self, server: &str, repo: &str, job_run_id: Uuid) -> Result<i64> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let record = inner
            .repos
            .entry((server.to_string(), repo.to_string()))
            .or_insert_with(|| empty_repo(server, repo));
        record.generation += 1;
        record.status = Some(SyncState::Pending);
        record.last_sync_started_at = Some(now);
        let generation = record.generation;

        inner.attempts.insert(
            (server.to_string(), repo.to_string(), generation),
            RepoAttempt {
                server_name: server.to_string(),
                repo_name: repo.to_string(),
                generation,
                job_run_id,
                state: SyncState::Pending,
                reason: None,
                error: None,
                started_at: now,
                ended_at: None,
            },
        );
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
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let Some(record) = inner
            .repos
            .get_mut(&(server.to_string(), repo.to_string()))
        else {
            return Ok(false);
        };
        if record.generation != generation || record.status.is_some_and(SyncState::is_terminal) {
            return Ok(false);
        }

        record.status = Some(state);
        if state.is_terminal() {
            record.last_sync_ended_at = Some(now);
            record.last_error = error.clone();
            record.last_failure_reason = reason;
        }

        if let Some(attempt) =
            inner
                .attempts
                .get_mut(&(server.to_string(), repo.to_string(), generation))
        {
            attempt.state = state;
            attempt.reason = reason;
            attempt.error = error;
            if state.is_terminal() {
                attempt.ended_at = Some(now);
            }
        }
        Ok(true)
    }

    async fn record_transition(
        &self,
        server: &str,
        repo: &str,
        generation: i64,
        transition: &Transition,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .transitions
            .entry((server.to_string(), repo.to_string(), generation))
            .or_default()
            .push(transition.clone());
        Ok(())
    }

    async fn transitions(
        &self,
        server: &str,
        repo: &str,
        generation: i64,
    ) -> Result<Vec<Transition>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transitions
            .get(&(server.to_string(), repo.to_string(), generation))
            .cloned()
            .unwrap_or_default())
    }

    async fn list_repos(&self, server: &str) -> Result<Vec<Repo>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .repos
            .values()
            .filter(|r| r.server_name == server)
            .cloned()
            .collect())
    }

    async fn repo_attempts(
        &self,
        server: &str,
        repo: &str,
        limit: usize,
    ) -> Result<Vec<RepoAttempt>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .attempts
            .values()
            .rev()
            .filter(|a| a.server_name == server && a.repo_name == repo)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn unfinished_attempts(&self, job_run_id: Uuid) -> Result<Vec<RepoAttempt>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .attempts
            .values()
            .filter(|a| a.job_run_id == job_run_id && !a.state.is_terminal())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job_run::{JobSpec, TaskKind};
    use crate::models::repo::RepoKind;
    use chrono::Duration;
    use std::sync::Arc;

    fn new_run(server: &str, group: &str) -> NewJobRun {
        let now = Utc::now();
        NewJobRun {
            server_name: server.into(),
            task: TaskKind::RepoGroupSync {
                group: group.into(),
            },
            spec: JobSpec {
                max_concurrent: 1,
                ..JobSpec::default()
            },
            scheduled_for: now,
            deadline: now + Duration::hours(1),
        }
    }

    fn remote(name: &str) -> RemoteRepo {
        RemoteRepo {
            name: name.into(),
            href: format!("/pulp/api/v3/repositories/rpm/rpm/{}/", name),
            kind: RepoKind::new("rpm", "rpm"),
            remote_href: None,
            latest_version_href: None,
        }
    }

    #[tokio::test]
    async fn test_create_job_run_if_idle_skips_active() {
        let store = MemoryStore::new();
        let first = store.create_job_run_if_idle(new_run("pulp1", "ext")).await.unwrap();
        assert!(first.is_some());
        let second = store.create_job_run_if_idle(new_run("pulp1", "ext")).await.unwrap();
        assert!(second.is_none());

        // Different group and different server are independent.
        assert!(store
            .create_job_run_if_idle(new_run("pulp1", "other"))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .create_job_run_if_idle(new_run("pulp2", "ext"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_finished_run_frees_slot() {
        let store = MemoryStore::new();
        let run = store
            .create_job_run_if_idle(new_run("pulp1", "ext"))
            .await
            .unwrap()
            .unwrap();
        store
            .finish_job_run(run.id, JobRunStatus::Succeeded, BTreeMap::new(), None)
            .await
            .unwrap();
        assert!(store
            .create_job_run_if_idle(new_run("pulp1", "ext"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_concurrent_create_yields_one_run() {
        let store = Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.create_job_run_if_idle(new_run("pulp1", "ext")).await.unwrap()
                })
            })
            .collect();
        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.active_job_runs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_and_mark_running() {
        let store = MemoryStore::new();
        let run = store
            .create_job_run_if_idle(new_run("pulp1", "ext"))
            .await
            .unwrap()
            .unwrap();
        let claimed = store.claim_next_pending("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, run.id);
        assert_eq!(claimed.status, JobRunStatus::Running);
        assert!(store.claim_next_pending("w2").await.unwrap().is_none());

        assert!(store.mark_job_run_running(run.id, "w1").await.unwrap());
        assert!(!store.mark_job_run_running(run.id, "w2").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_generation_update_is_ignored() {
        let store = MemoryStore::new();
        let run_id = Uuid::new_v4();
        let g1 = store.begin_repo_attempt("pulp1", "ext-foo", run_id).await.unwrap();
        let g2 = store.begin_repo_attempt("pulp1", "ext-foo", run_id).await.unwrap();
        assert_eq!(g2, g1 + 1);

        let applied = store
            .update_repo_status("pulp1", "ext-foo", g1, SyncState::Failed, None, None)
            .await
            .unwrap();
        assert!(!applied);
        let applied = store
            .update_repo_status("pulp1", "ext-foo", g2, SyncState::Succeeded, None, None)
            .await
            .unwrap();
        assert!(applied);

        let repos = store.list_repos("pulp1").await.unwrap();
        assert_eq!(repos[0].status, Some(SyncState::Succeeded));
        assert!(repos[0].last_sync_ended_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_status_is_not_overwritten() {
        let store = MemoryStore::new();
        let g = store
            .begin_repo_attempt("pulp1", "ext-foo", Uuid::new_v4())
            .await
            .unwrap();
        assert!(store
            .update_repo_status(
                "pulp1",
                "ext-foo",
                g,
                SyncState::Failed,
                Some(FailureReason::WorkerLost),
                Some("worker lost".into()),
            )
            .await
            .unwrap());

        // A late writer for the same generation must not flip the result.
        let applied = store
            .update_repo_status("pulp1", "ext-foo", g, SyncState::Succeeded, None, None)
            .await
            .unwrap();
        assert!(!applied);

        let repos = store.list_repos("pulp1").await.unwrap();
        assert_eq!(repos[0].status, Some(SyncState::Failed));
        assert_eq!(repos[0].last_failure_reason, Some(FailureReason::WorkerLost));
    }

    #[tokio::test]
    async fn test_finish_job_run_only_once() {
        let store = MemoryStore::new();
        let run = store
            .create_job_run_if_idle(new_run("pulp1", "ext"))
            .await
            .unwrap()
            .unwrap();
        assert!(store
            .finish_job_run(run.id, JobRunStatus::Failed, BTreeMap::new(), Some("lost".into()))
            .await
            .unwrap());
        assert!(!store
            .finish_job_run(run.id, JobRunStatus::Succeeded, BTreeMap::new(), None)
            .await
            .unwrap());

        let run = store.get_job_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, JobRunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("lost"));
    }

    #[tokio::test]
    async fn test_inventory_marks_missing_repos_stale() {
        let store = MemoryStore::new();
        let change = store
            .sync_inventory("pulp1", &[remote("a"), remote("b")])
            .await
            .unwrap();
        assert_eq!(change.added, vec!["a", "b"]);

        let change = store.sync_inventory("pulp1", &[remote("b")]).await.unwrap();
        assert!(change.added.is_empty());
        assert_eq!(change.marked_stale, vec!["a"]);

        let repos = store.list_repos("pulp1").await.unwrap();
        assert_eq!(repos.len(), 2);
        assert!(repos.iter().find(|r| r.name == "a").unwrap().stale);

        // Reappearing clears the flag.
        store.sync_inventory("pulp1", &[remote("a")]).await.unwrap();
        let repos = store.list_repos("pulp1").await.unwrap();
        assert!(!repos.iter().find(|r| r.name == "a").unwrap().stale);
    }

    #[tokio::test]
    async fn test_unfinished_attempts() {
        let store = MemoryStore::new();
        let run_id = Uuid::new_v4();
        let ga = store.begin_repo_attempt("pulp1", "a", run_id).await.unwrap();
        store.begin_repo_attempt("pulp1", "b", run_id).await.unwrap();
        store
            .update_repo_status("pulp1", "a", ga, SyncState::Succeeded, None, None)
            .await
            .unwrap();

        let unfinished = store.unfinished_attempts(run_id).await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].repo_name, "b");
    }

    #[tokio::test]
    async fn test_schedule_marker_only_moves_forward() {
        let store = MemoryStore::new();
        let t1 = Utc::now();
        let t0 = t1 - Duration::minutes(5);
        store.set_schedule_marker("pulp1", "snapshot", t1).await.unwrap();
        store.set_schedule_marker("pulp1", "snapshot", t0).await.unwrap();
        assert_eq!(
            store.schedule_marker("pulp1", "snapshot").await.unwrap(),
            Some(t1)
        );
    }
}
