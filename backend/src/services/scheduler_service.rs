//! Cron-driven job scheduler.
//!
//! Whether a task is due is a pure function of the cron schedule, the last
//! fire time stored in the durable store and the current time. Several
//! scheduler instances may tick concurrently; the store's one-active-run
//! rule keeps them from double-dispatching.

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::join_all;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::job_run::{JobRun, NewJobRun, TaskKind};
use crate::services::fleet_config_service::{FleetConfig, TaskDefinition};
use crate::services::job_queue::JobQueue;
use crate::services::metrics_service;
use crate::services::store::SyncStore;

// ── Cron helpers ────────────────────────────────────────────────────────────

/// A parsed cron expression, keeping the text it was written as.
#[derive(Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: Schedule,
}

impl CronSchedule {
    /// Parse a 5-, 6- or 7-field cron expression.
    pub fn parse(expr: &str) -> std::result::Result<Self, String> {
        Schedule::from_str(&normalize_cron(expr))
            .map(|schedule| Self {
                expr: expr.to_string(),
                schedule,
            })
            .map_err(|e| format!("invalid cron expression '{}': {}", expr, e))
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expr).finish()
    }
}

/// The cron crate expects a leading seconds field; operators write the
/// classic 5-field form.
fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

/// Latest fire time `f` with `max(marker, now - lookback) < f <= now`.
///
/// Fire times missed by more than `lookback` are dropped rather than
/// replayed, and at most one fire is reported per call.
pub fn due_fire_time(
    schedule: &CronSchedule,
    marker: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    lookback: chrono::Duration,
) -> Option<DateTime<Utc>> {
    let floor = now - lookback;
    let start = match marker {
        Some(m) if m > floor => m,
        _ => floor,
    };
    schedule
        .schedule
        .after(&start)
        .take_while(|fire| *fire <= now)
        .last()
}

/// Absolute deadline `max_runtime` after `now`.
pub fn deadline_after(now: DateTime<Utc>, max_runtime: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(max_runtime)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ── Scheduler ───────────────────────────────────────────────────────────────

pub struct SchedulerService {
    store: Arc<dyn SyncStore>,
    queue: Arc<dyn JobQueue>,
    fleet: watch::Receiver<Arc<FleetConfig>>,
    lookback: chrono::Duration,
}

impl SchedulerService {
    /// `tick` is the evaluation interval; fires older than two ticks are
    /// not caught up.
    pub fn new(
        store: Arc<dyn SyncStore>,
        queue: Arc<dyn JobQueue>,
        fleet: watch::Receiver<Arc<FleetConfig>>,
        tick: Duration,
    ) -> Self {
        let lookback = chrono::Duration::from_std(tick * 2)
            .unwrap_or_else(|_| chrono::Duration::minutes(2));
        Self {
            store,
            queue,
            fleet,
            lookback,
        }
    }

    pub fn with_lookback(mut self, lookback: chrono::Duration) -> Self {
        self.lookback = lookback;
        self
    }

    /// Evaluate every scheduled task once against `now`. Returns the runs
    /// created by this tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<JobRun> {
        let fleet = self.fleet.borrow().clone();
        let tasks = fleet.scheduled_tasks();

        let results = join_all(tasks.iter().map(|task| self.evaluate(task, now))).await;

        let mut created = Vec::new();
        for (task, result) in tasks.iter().zip(results) {
            match result {
                Ok(Some(run)) => created.push(run),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    server = %task.server,
                    "Failed to evaluate schedule for {}: {}",
                    task.task,
                    e
                ),
            }
        }
        created
    }

    async fn evaluate(&self, task: &TaskDefinition, now: DateTime<Utc>) -> Result<Option<JobRun>> {
        let Some(schedule) = &task.schedule else {
            return Ok(None);
        };
        let key = task.task.task_key();
        let marker = self.store.schedule_marker(&task.server, &key).await?;

        let Some(fire) = due_fire_time(schedule, marker, now, self.lookback) else {
            return Ok(None);
        };

        let created = self
            .store
            .create_job_run_if_idle(NewJobRun {
                server_name: task.server.clone(),
                task: task.task.clone(),
                spec: task.spec.clone(),
                scheduled_for: fire,
                deadline: deadline_after(now, task.max_runtime),
            })
            .await?;
        self.store.set_schedule_marker(&task.server, &key, fire).await?;
        metrics_service::record_schedule_fire(task.task.label(), created.is_some());

        match &created {
            Some(run) => {
                tracing::info!(
                    server = %task.server,
                    job_run_id = %run.id,
                    "Scheduled {} (fire time {})",
                    task.task,
                    fire
                );
                self.queue.push(run.clone()).await?;
            }
            None => tracing::debug!(
                server = %task.server,
                "Skipping {} at {}: a run is already active",
                task.task,
                fire
            ),
        }
        Ok(created)
    }

    /// Create a run outside the cron schedule. Returns `None` when a run
    /// for the same task is already active.
    pub async fn enqueue_adhoc(&self, server: &str, task: &TaskKind) -> Result<Option<JobRun>> {
        let definition = self.fleet.borrow().task_definition(server, task)?;
        self.enqueue_definition(definition).await
    }

    /// Create a run for a task built outside the fleet config, such as a
    /// repo removal. Same idle rule as [`Self::enqueue_adhoc`].
    pub async fn enqueue_definition(&self, definition: TaskDefinition) -> Result<Option<JobRun>> {
        let now = Utc::now();
        let server = definition.server.clone();
        let task = definition.task.clone();

        let created = self
            .store
            .create_job_run_if_idle(NewJobRun {
                server_name: definition.server,
                task: definition.task,
                spec: definition.spec,
                scheduled_for: now,
                deadline: deadline_after(now, definition.max_runtime),
            })
            .await?;

        if let Some(run) = &created {
            tracing::info!(server = %server, job_run_id = %run.id, "Enqueued ad-hoc {}", task);
            self.queue.push(run.clone()).await?;
        }
        Ok(created)
    }
}

/// Tick the scheduler on a fixed interval until `shutdown` fires.
pub fn spawn_scheduler(
    service: Arc<SchedulerService>,
    tick: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("Scheduler started (tick {:?})", tick);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let created = service.tick(Utc::now()).await;
            if !created.is_empty() {
                tracing::debug!("Scheduler tick created {} job runs", created.len());
            }
        }
        tracing::info!("Scheduler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fleet_config_service::parse_fleet_config;
    use crate::services::job_queue::ChannelQueue;
    use crate::services::store::MemoryStore;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_parse_five_field() {
        let schedule = CronSchedule::parse("0 2 * * *").unwrap();
        assert_eq!(schedule.expr(), "0 2 * * *");
        assert_eq!(schedule.next_after(at(1, 0, 0)), Some(at(2, 0, 0)));
    }

    #[test]
    fn test_parse_six_field() {
        let schedule = CronSchedule::parse("30 0 2 * * *").unwrap();
        assert_eq!(schedule.next_after(at(1, 0, 0)), Some(at(2, 0, 30)));
    }

    #[test]
    fn test_parse_invalid() {
        let err = CronSchedule::parse("every day").unwrap_err();
        assert!(err.contains("invalid cron expression"), "{}", err);
    }

    #[test]
    fn test_due_fire_time_no_marker_within_lookback() {
        let schedule = CronSchedule::parse("0 2 * * *").unwrap();
        let due = due_fire_time(&schedule, None, at(2, 0, 30), chrono::Duration::minutes(2));
        assert_eq!(due, Some(at(2, 0, 0)));
    }

    #[test]
    fn test_due_fire_time_outside_lookback() {
        let schedule = CronSchedule::parse("0 2 * * *").unwrap();
        let due = due_fire_time(&schedule, None, at(3, 0, 0), chrono::Duration::minutes(2));
        assert_eq!(due, None);
    }

    #[test]
    fn test_due_fire_time_marker_suppresses_refire() {
        let schedule = CronSchedule::parse("0 2 * * *").unwrap();
        let due = due_fire_time(
            &schedule,
            Some(at(2, 0, 0)),
            at(2, 1, 0),
            chrono::Duration::minutes(2),
        );
        assert_eq!(due, None);
    }

    #[test]
    fn test_due_fire_time_returns_latest_missed_fire() {
        let schedule = CronSchedule::parse("*/10 * * * *").unwrap();
        let due = due_fire_time(
            &schedule,
            Some(at(1, 0, 0)),
            at(1, 35, 0),
            chrono::Duration::hours(1),
        );
        assert_eq!(due, Some(at(1, 30, 0)));
    }

    #[test]
    fn test_due_fire_time_exactly_now() {
        let schedule = CronSchedule::parse("*/10 * * * *").unwrap();
        let due = due_fire_time(&schedule, Some(at(1, 0, 0)), at(1, 10, 0), chrono::Duration::hours(1));
        assert_eq!(due, Some(at(1, 10, 0)));
    }

    #[test]
    fn test_deadline_after() {
        let now = at(1, 0, 0);
        assert_eq!(deadline_after(now, Duration::from_secs(3600)), at(2, 0, 0));
    }

    const FLEET: &str = r#"
credentials:
  default:
    username: admin
    password_env: PULP_PASSWORD
repo_groups:
  external:
    regex_include: "^ext-"
pulp_servers:
  pulp1.example.com:
    credentials: default
    repo_groups:
      external:
        schedule: "*/10 * * * *"
        max_concurrent_syncs: 2
        max_runtime: 1h
"#;

    fn scheduler() -> (SchedulerService, Arc<MemoryStore>, Arc<ChannelQueue>) {
        let fleet = parse_fleet_config(FLEET).unwrap();
        let (_tx, rx) = watch::channel(Arc::new(fleet));
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(ChannelQueue::new());
        let service = SchedulerService::new(
            store.clone(),
            queue.clone(),
            rx,
            Duration::from_secs(60),
        );
        (service, store, queue)
    }

    #[tokio::test]
    async fn test_tick_creates_and_dispatches_due_run() {
        let (service, store, queue) = scheduler();
        let created = service.tick(at(1, 10, 30)).await;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].scheduled_for, at(1, 10, 0));
        assert_eq!(created[0].deadline, at(2, 10, 30));
        assert_eq!(created[0].spec.max_concurrent, 2);

        let cancel = CancellationToken::new();
        assert_eq!(queue.pop(&cancel).await.unwrap().id, created[0].id);
        let marker = store
            .schedule_marker("pulp1.example.com", "repo_group_sync:external")
            .await
            .unwrap();
        assert_eq!(marker, Some(at(1, 10, 0)));
    }

    #[tokio::test]
    async fn test_tick_is_idempotent() {
        let (service, _store, _queue) = scheduler();
        assert_eq!(service.tick(at(1, 10, 30)).await.len(), 1);
        assert!(service.tick(at(1, 10, 45)).await.is_empty());
    }

    #[tokio::test]
    async fn test_active_run_blocks_next_fire_but_marker_advances() {
        let (service, store, _queue) = scheduler();
        assert_eq!(service.tick(at(1, 10, 30)).await.len(), 1);
        assert!(service.tick(at(1, 20, 30)).await.is_empty());
        let marker = store
            .schedule_marker("pulp1.example.com", "repo_group_sync:external")
            .await
            .unwrap();
        assert_eq!(marker, Some(at(1, 20, 0)));
    }

    #[tokio::test]
    async fn test_enqueue_adhoc_unknown_server() {
        let (service, _store, _queue) = scheduler();
        let task = TaskKind::RepoGroupSync {
            group: "external".to_string(),
        };
        assert!(service.enqueue_adhoc("nope.example.com", &task).await.is_err());
    }

    #[tokio::test]
    async fn test_enqueue_adhoc_respects_active_run() {
        let (service, _store, _queue) = scheduler();
        let task = TaskKind::RepoGroupSync {
            group: "external".to_string(),
        };
        assert!(service
            .enqueue_adhoc("pulp1.example.com", &task)
            .await
            .unwrap()
            .is_some());
        assert!(service
            .enqueue_adhoc("pulp1.example.com", &task)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_enqueue_removal_outside_fleet_config() {
        let (service, _store, queue) = scheduler();
        let fleet = parse_fleet_config(FLEET).unwrap();
        let definition = fleet
            .removal_definition("pulp1.example.com", Some("^ext-old-"), None, true)
            .unwrap();

        let run = service
            .enqueue_definition(definition.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.task, TaskKind::RepoRemoval);
        assert!(run.spec.dry_run);
        assert!(service.enqueue_definition(definition).await.unwrap().is_none());

        let cancel = CancellationToken::new();
        assert_eq!(queue.pop(&cancel).await.unwrap().id, run.id);
    }
}
