//! Fleet health report model.

use serde::Serialize;

use super::job_run::JobRun;
use super::repo::Repo;

/// Traffic-light health of a repo or server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthColor {
    Green,
    Amber,
    Red,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoHealth {
    #[serde(flatten)]
    pub repo: Repo,
    /// `None` until the repo has finished at least one attempt.
    pub health: Option<HealthColor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    pub server: String,
    pub health: HealthColor,
    pub repos: Vec<RepoHealth>,
    pub recent_runs: Vec<JobRun>,
}
