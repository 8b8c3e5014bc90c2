//! Handles to asynchronous operations executed by a repository server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::repo::{FollowUpStep, RepoKind};

/// Href of a task on the server, e.g. `/pulp/api/v3/tasks/<id>/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteTaskHandle(pub String);

impl fmt::Display for RemoteTaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task state as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Waiting,
    Running,
    Canceling,
    Completed,
    Skipped,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Skipped | TaskState::Failed | TaskState::Canceled
        )
    }

    pub fn is_success(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Skipped)
    }
}

/// One poll of a remote task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPoll {
    pub state: TaskState,
    pub error: Option<String>,
    pub created_resources: Vec<String>,
}

impl TaskPoll {
    pub fn waiting() -> Self {
        Self {
            state: TaskState::Waiting,
            error: None,
            created_resources: Vec::new(),
        }
    }

    pub fn completed() -> Self {
        Self {
            state: TaskState::Completed,
            error: None,
            created_resources: Vec::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: TaskState::Failed,
            error: Some(error.into()),
            created_resources: Vec::new(),
        }
    }
}

/// A remote task owned by the monitor while it is being waited on.
#[derive(Debug, Clone)]
pub struct RemoteTask {
    pub handle: RemoteTaskHandle,
    pub submitted_at: DateTime<Utc>,
    pub state: TaskState,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl RemoteTask {
    pub fn new(handle: RemoteTaskHandle) -> Self {
        Self {
            handle,
            submitted_at: Utc::now(),
            state: TaskState::Waiting,
            last_polled_at: None,
        }
    }
}

/// Packages stripped from externally fed repos between sync and publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannedPackages {
    pub regex: String,
    /// Remotes whose URL contains one of these are left untouched.
    #[serde(default)]
    pub internal_domains: Vec<String>,
}

impl BannedPackages {
    pub fn applies_to(&self, remote_url: &str) -> bool {
        !self
            .internal_domains
            .iter()
            .any(|domain| !domain.is_empty() && remote_url.contains(domain.as_str()))
    }
}

/// Operation the workflow drives a repo through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Pull new content from the repo's remote.
    Sync {
        #[serde(default)]
        options: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        banned_packages: Option<BannedPackages>,
    },
    /// Copy the latest version into a new repo called `name`.
    Snapshot { name: String },
    /// Delete the repo's distribution, then the repo, then its remote.
    Remove,
    /// Drop content units from the latest version.
    RemoveContent {
        content_hrefs: Vec<String>,
        #[serde(default)]
        force_publish: bool,
    },
}

impl Operation {
    /// Steps run from `verifying`, in order, for a repo of `kind`.
    pub fn follow_up_steps(&self, kind: &RepoKind) -> Vec<FollowUpStep> {
        let supported = kind.capabilities().follow_up_steps;
        match self {
            Operation::Sync {
                banned_packages, ..
            } => supported
                .iter()
                .copied()
                .filter(|step| {
                    *step != FollowUpStep::RemoveBannedPackages || banned_packages.is_some()
                })
                .collect(),
            Operation::Snapshot { .. } | Operation::RemoveContent { .. } => supported
                .iter()
                .copied()
                .filter(|step| *step == FollowUpStep::Publish)
                .collect(),
            Operation::Remove => vec![FollowUpStep::DeleteRepository, FollowUpStep::DeleteRemote],
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Operation::Sync { .. } => "sync",
            Operation::Snapshot { .. } => "snapshot",
            Operation::Remove => "removal",
            Operation::RemoveContent { .. } => "content removal",
        }
    }
}

/// How the server answered a request to start a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStart {
    /// The server queued a task to wait on.
    Task(RemoteTaskHandle),
    /// The server finished the step synchronously.
    Immediate,
    /// Nothing to do (e.g. the latest version is already published).
    Skipped,
}
