//! Repository model: kinds, sync states and per-attempt records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Per-repo sync state.
///
/// `Succeeded`, `Failed` and `Cancelled` are terminal for a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "repo_sync_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Discovering,
    Syncing,
    Verifying,
    Succeeded,
    Failed,
    Cancelled,
}

impl SyncState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SyncState::Succeeded | SyncState::Failed | SyncState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Discovering => "discovering",
            SyncState::Syncing => "syncing",
            SyncState::Verifying => "verifying",
            SyncState::Succeeded => "succeeded",
            SyncState::Failed => "failed",
            SyncState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification attached to `failed` and `cancelled` outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "failure_reason", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Retry budget exhausted on a timeout, 5xx or connection error.
    Transient,
    /// Rejected credentials, missing repo, bad configuration.
    Permanent,
    /// The server ran the task and reported it failed.
    RemoteTask,
    /// Polling the task kept failing at the transport level.
    Monitor,
    /// The owning job run hit its deadline.
    DeadlineExceeded,
    /// The worker driving the repo went away.
    WorkerLost,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::Transient => "transient",
            FailureReason::Permanent => "permanent",
            FailureReason::RemoteTask => "remote_task",
            FailureReason::Monitor => "monitor",
            FailureReason::DeadlineExceeded => "deadline_exceeded",
            FailureReason::WorkerLost => "worker_lost",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra remote step run after an operation's main step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpStep {
    /// Strip packages matching the banned-package pattern.
    RemoveBannedPackages,
    Publish,
    DeleteRepository,
    DeleteRemote,
}

/// What the sync workflow may do differently for a repo kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindCapabilities {
    /// Skip the sync call when the server reports nothing to sync.
    pub noop_short_circuit: bool,
    /// Follow-up steps this kind supports after a sync, in order.
    pub follow_up_steps: &'static [FollowUpStep],
    /// The server can copy the latest version into a snapshot repo.
    pub snapshot: bool,
}

const PUBLISH_ONLY: &[FollowUpStep] = &[FollowUpStep::Publish];
const FILTER_THEN_PUBLISH: &[FollowUpStep] =
    &[FollowUpStep::RemoveBannedPackages, FollowUpStep::Publish];

/// Repository kind as reported by the server, e.g. `rpm/rpm` or `container/container`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoKind {
    pub plugin: String,
    pub repo_type: String,
}

impl RepoKind {
    pub fn new(plugin: impl Into<String>, repo_type: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            repo_type: repo_type.into(),
        }
    }

    /// Derive the kind from a repository href of the form
    /// `/pulp/api/v3/repositories/<plugin>/<type>/<id>/`.
    pub fn from_href(href: &str) -> Option<Self> {
        let rest = href.split("/repositories/").nth(1)?;
        let mut parts = rest.split('/').filter(|s| !s.is_empty());
        let plugin = parts.next()?;
        let repo_type = parts.next()?;
        Some(Self::new(plugin, repo_type))
    }

    pub fn capabilities(&self) -> KindCapabilities {
        match self.plugin.as_str() {
            "rpm" | "deb" => KindCapabilities {
                noop_short_circuit: true,
                follow_up_steps: FILTER_THEN_PUBLISH,
                snapshot: true,
            },
            "file" => KindCapabilities {
                noop_short_circuit: true,
                follow_up_steps: PUBLISH_ONLY,
                snapshot: false,
            },
            "python" => KindCapabilities {
                noop_short_circuit: false,
                follow_up_steps: PUBLISH_ONLY,
                snapshot: false,
            },
            _ => KindCapabilities {
                noop_short_circuit: false,
                follow_up_steps: &[],
                snapshot: false,
            },
        }
    }
}

impl fmt::Display for RepoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.plugin, self.repo_type)
    }
}

/// A repository as listed by a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRepo {
    pub name: String,
    pub href: String,
    pub kind: RepoKind,
    pub remote_href: Option<String>,
    pub latest_version_href: Option<String>,
}

/// Current state of one repository, fetched during `discovering`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRepoState {
    pub has_remote: bool,
    /// The server has nothing new to pull for this repo.
    pub content_current: bool,
    pub latest_version_href: Option<String>,
}

/// A repository known to a server, as tracked in the store.
#[derive(Debug, Clone, Serialize)]
pub struct Repo {
    pub server_name: String,
    pub name: String,
    pub href: String,
    pub kind: Option<RepoKind>,
    /// No longer reported by the server.
    pub stale: bool,
    pub status: Option<SyncState>,
    pub generation: i64,
    pub last_sync_started_at: Option<DateTime<Utc>>,
    pub last_sync_ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_failure_reason: Option<FailureReason>,
}

/// One sync attempt of a repo; one row per generation.
#[derive(Debug, Clone, Serialize)]
pub struct RepoAttempt {
    pub server_name: String,
    pub repo_name: String,
    pub generation: i64,
    pub job_run_id: Uuid,
    pub state: SyncState,
    pub reason: Option<FailureReason>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Outcome of a repo within one job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoOutcome {
    pub state: SyncState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RepoOutcome {
    pub fn succeeded() -> Self {
        Self {
            state: SyncState::Succeeded,
            reason: None,
            error: None,
        }
    }

    pub fn failed(reason: FailureReason, error: impl Into<String>) -> Self {
        Self {
            state: SyncState::Failed,
            reason: Some(reason),
            error: Some(error.into()),
        }
    }
}

/// Result of refreshing a server's repo inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryChange {
    pub added: Vec<String>,
    pub marked_stale: Vec<String>,
}
