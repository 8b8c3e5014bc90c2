//! Test fixtures and data factories for engine tests
//!
//! Provides reusable test data for:
//! - A two-server fleet config
//! - Remote repos of various kinds
//! - Job runs created directly in a store

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use pulp_manager_backend::models::job_run::{JobRun, JobSpec, NewJobRun, TaskKind};
use pulp_manager_backend::models::repo::{RemoteRepo, RepoKind};
use pulp_manager_backend::services::fleet_config_service::{parse_fleet_config, FleetConfig};
use pulp_manager_backend::services::store::SyncStore;

pub const PRIMARY: &str = "pulp1.example.com";
pub const SECONDARY: &str = "pulp2.example.com";

pub const FLEET: &str = r#"
credentials:
  ops:
    username: sync-bot
    password_env: PULP_MANAGER_TEST_PASSWORD
repo_groups:
  el9-base:
    regex_include: "^el9-"
  ext:
    regex_include: "^ext-"
    regex_exclude: "bar$"
pulp_servers:
  pulp1.example.com:
    credentials: ops
    repo_groups:
      el9-base:
        schedule: "*/10 * * * *"
        max_concurrent_syncs: 2
        max_runtime: 1h
      ext:
        max_concurrent_syncs: 1
        max_runtime: 30m
    snapshot_support:
      max_concurrent_snapshots: 1
  pulp2.example.com:
    credentials: ops
    role: secondary
    pulp_primary: pulp1.example.com
    repo_groups:
      el9-base:
        max_concurrent_syncs: 2
        max_runtime: 1h
"#;

pub fn fleet() -> FleetConfig {
    parse_fleet_config(FLEET).expect("fixture fleet is valid")
}

pub fn repo(plugin: &str, name: &str) -> RemoteRepo {
    RemoteRepo {
        name: name.to_string(),
        href: format!("/pulp/api/v3/repositories/{}/{}/{}/", plugin, plugin, name),
        kind: RepoKind::new(plugin, plugin),
        remote_href: Some(format!("/pulp/api/v3/remotes/{}/{}/{}/", plugin, plugin, name)),
        latest_version_href: None,
    }
}

pub fn rpm_repo(name: &str) -> RemoteRepo {
    repo("rpm", name)
}

pub fn rpm_repos(names: &[&str]) -> Vec<RemoteRepo> {
    names.iter().map(|n| rpm_repo(n)).collect()
}

/// Spec for a group sync as the fleet would capture it.
pub fn sync_spec(include: &str, max_concurrent: usize) -> JobSpec {
    JobSpec {
        regex_include: Some(include.to_string()),
        max_concurrent,
        ..JobSpec::default()
    }
}

/// Create a pending run directly in the store.
pub async fn create_run(
    store: &Arc<dyn SyncStore>,
    server: &str,
    task: TaskKind,
    spec: JobSpec,
    deadline: DateTime<Utc>,
) -> JobRun {
    store
        .create_job_run_if_idle(NewJobRun {
            server_name: server.to_string(),
            task,
            spec,
            scheduled_for: Utc::now(),
            deadline,
        })
        .await
        .expect("store accepts run")
        .expect("no active run for task")
}

pub fn group(name: &str) -> TaskKind {
    TaskKind::RepoGroupSync {
        group: name.to_string(),
    }
}

/// Wall-clock deadline `after` from now.
pub fn deadline_in(after: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(after).expect("duration in range")
}
