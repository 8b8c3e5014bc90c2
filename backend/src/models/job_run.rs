//! Job run model: one dispatched execution of a scheduled task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::repo::RepoOutcome;

/// The kind of recurring task a job run executes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    RepoGroupSync { group: String },
    ConfigRegistration,
    Snapshot,
    /// Delete matching repos with their distributions and remotes.
    RepoRemoval,
    /// Drop content units from one repo's latest version.
    RemoveContent { repo: String },
}

impl TaskKind {
    /// Key identifying the task on its server. At most one active job run
    /// exists per `(server, task_key)`.
    pub fn task_key(&self) -> String {
        match self {
            TaskKind::RepoGroupSync { group } => format!("repo_group_sync:{}", group),
            TaskKind::ConfigRegistration => "config_registration".to_string(),
            TaskKind::Snapshot => "snapshot".to_string(),
            TaskKind::RepoRemoval => "repo_removal".to_string(),
            TaskKind::RemoveContent { repo } => format!("remove_content:{}", repo),
        }
    }

    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::RepoGroupSync { .. } => "repo_group_sync",
            TaskKind::ConfigRegistration => "config_registration",
            TaskKind::Snapshot => "snapshot",
            TaskKind::RepoRemoval => "repo_removal",
            TaskKind::RemoveContent { .. } => "remove_content",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.task_key())
    }
}

/// Job run status. `Pending` and `Running` are the active states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    CancelledTimeout,
}

impl JobRunStatus {
    pub fn is_active(self) -> bool {
        matches!(self, JobRunStatus::Pending | JobRunStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobRunStatus::Pending => "pending",
            JobRunStatus::Running => "running",
            JobRunStatus::Succeeded => "succeeded",
            JobRunStatus::Failed => "failed",
            JobRunStatus::CancelledTimeout => "cancelled_timeout",
        }
    }
}

impl fmt::Display for JobRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters captured from the fleet config when the run was created, so a
/// config reload never changes a run already in flight.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub regex_include: Option<String>,
    #[serde(default)]
    pub regex_exclude: Option<String>,
    /// Gate size for the run's repos.
    pub max_concurrent: usize,
    /// Primary to mirror from before syncing, for secondaries.
    #[serde(default)]
    pub upstream: Option<String>,
    #[serde(default)]
    pub sync_options: serde_json::Value,
    #[serde(default)]
    pub snapshot_prefix: Option<String>,
    /// Packages matching this are dropped after a sync, before publishing.
    #[serde(default)]
    pub banned_package_regex: Option<String>,
    /// Remotes whose URL contains one of these are trusted as-is.
    #[serde(default)]
    pub internal_domains: Vec<String>,
    /// Repo removal only reports what it would delete.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub content_hrefs: Vec<String>,
    /// Publish after a content removal even if no new version was created.
    #[serde(default)]
    pub force_publish: bool,
}

/// One dispatched execution of a scheduled (or ad-hoc) task.
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub id: Uuid,
    pub server_name: String,
    pub task: TaskKind,
    pub spec: JobSpec,
    pub status: JobRunStatus,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Absolute; computed once when the run is created.
    pub deadline: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub worker: Option<String>,
    pub error: Option<String>,
    pub repo_outcomes: BTreeMap<String, RepoOutcome>,
    pub created_at: DateTime<Utc>,
}

impl JobRun {
    pub fn task_key(&self) -> String {
        self.task.task_key()
    }
}

/// Input to `create_job_run_if_idle`.
#[derive(Debug, Clone)]
pub struct NewJobRun {
    pub server_name: String,
    pub task: TaskKind,
    pub spec: JobSpec,
    pub scheduled_for: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_key() {
        let task = TaskKind::RepoGroupSync {
            group: "el9-base".into(),
        };
        assert_eq!(task.task_key(), "repo_group_sync:el9-base");
        assert_eq!(TaskKind::Snapshot.task_key(), "snapshot");
        assert_eq!(
            TaskKind::ConfigRegistration.task_key(),
            "config_registration"
        );
        assert_eq!(TaskKind::RepoRemoval.task_key(), "repo_removal");
        let remove = TaskKind::RemoveContent {
            repo: "el9-baseos".into(),
        };
        assert_eq!(remove.task_key(), "remove_content:el9-baseos");
        assert_eq!(remove.label(), "remove_content");
    }

    #[test]
    fn test_spec_fields_default_when_absent() {
        let spec: JobSpec = serde_json::from_value(serde_json::json!({
            "regex_include": "^ext-",
            "max_concurrent": 2
        }))
        .unwrap();
        assert!(!spec.dry_run);
        assert!(spec.internal_domains.is_empty());
        assert!(spec.banned_package_regex.is_none());
        assert!(spec.content_hrefs.is_empty());
    }

    #[test]
    fn test_task_kind_json_shape() {
        let task = TaskKind::RepoGroupSync {
            group: "ext".into(),
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["kind"], "repo_group_sync");
        assert_eq!(json["group"], "ext");
        let back: TaskKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_active_statuses() {
        assert!(JobRunStatus::Pending.is_active());
        assert!(JobRunStatus::Running.is_active());
        assert!(!JobRunStatus::Succeeded.is_active());
        assert!(!JobRunStatus::Failed.is_active());
        assert!(!JobRunStatus::CancelledTimeout.is_active());
    }
}
