//! Read-side health report: repo status colours and recent job runs.

use std::sync::Arc;

use crate::error::Result;
use crate::models::health::{HealthColor, RepoHealth, ServerHealth};
use crate::models::repo::{RepoAttempt, SyncState};
use crate::services::store::SyncStore;

/// Terminal attempts considered when colouring a repo.
pub const HEALTH_WINDOW: usize = 5;

/// Failures within the window still tolerated as amber.
const AMBER_MAX_FAILURES: usize = 3;

/// Colour a repo from its attempts, newest first.
///
/// Green when the latest terminal attempt succeeded; amber when at most
/// three of the last five failed and at least one succeeded; red otherwise.
/// `None` until an attempt has finished.
pub fn repo_health_color(attempts: &[RepoAttempt]) -> Option<HealthColor> {
    let window: Vec<&RepoAttempt> = attempts
        .iter()
        .filter(|a| a.state.is_terminal())
        .take(HEALTH_WINDOW)
        .collect();

    let latest = window.first()?;
    if latest.state == SyncState::Succeeded {
        return Some(HealthColor::Green);
    }

    let successes = window
        .iter()
        .filter(|a| a.state == SyncState::Succeeded)
        .count();
    let failures = window.len() - successes;
    if failures <= AMBER_MAX_FAILURES && successes >= 1 {
        Some(HealthColor::Amber)
    } else {
        Some(HealthColor::Red)
    }
}

/// Worst colour across a server's live repos. Stale and never-synced repos
/// don't count.
pub fn server_health_color(repos: &[RepoHealth]) -> HealthColor {
    repos
        .iter()
        .filter(|r| !r.repo.stale)
        .filter_map(|r| r.health)
        .max()
        .unwrap_or(HealthColor::Green)
}

pub struct HealthService {
    store: Arc<dyn SyncStore>,
}

impl HealthService {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    /// Current repo status and the last `runs_limit` job runs for `server`.
    pub async fn server_health(&self, server: &str, runs_limit: usize) -> Result<ServerHealth> {
        let mut repos = Vec::new();
        for repo in self.store.list_repos(server).await? {
            let attempts = self
                .store
                .repo_attempts(server, &repo.name, HEALTH_WINDOW + 1)
                .await?;
            repos.push(RepoHealth {
                health: repo_health_color(&attempts),
                repo,
            });
        }

        let recent_runs = self.store.recent_job_runs(server, runs_limit).await?;
        Ok(ServerHealth {
            server: server.to_string(),
            health: server_health_color(&repos),
            repos,
            recent_runs,
        })
    }
}
