//! Command-line interface for Pulp Manager.

pub mod runner;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::models::job_run::TaskKind;

pub use runner::run;

/// Keeps a fleet of Pulp servers in sync on a schedule
#[derive(Parser, Debug)]
#[command(name = "pulp-manager", version)]
#[command(about = "Schedule and run Pulp repository syncs across a fleet", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the sync config (YAML); overrides SYNC_CONFIG_PATH
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Run the scheduler and a worker in one process
    Run,

    /// Run only the scheduler
    Scheduler,

    /// Run only a worker
    Worker,

    /// Validate the sync config and print the scheduled tasks
    CheckConfig,

    /// Print repo health and recent job runs for a server as JSON
    Status {
        /// Server name as written in the sync config
        #[arg(long)]
        server: String,

        /// Number of recent job runs to include
        #[arg(long, default_value_t = 10)]
        runs: usize,
    },

    /// Enqueue an ad-hoc run of a task from the sync config
    Sync {
        #[arg(long)]
        server: String,

        #[command(flatten)]
        target: SyncTarget,
    },

    /// Remove matching repos together with their distributions and remotes
    RemoveRepos {
        #[arg(long)]
        server: String,

        #[arg(long)]
        regex_include: Option<String>,

        #[arg(long)]
        regex_exclude: Option<String>,

        /// Delete for real; without it the run only reports what it would remove
        #[arg(long)]
        execute: bool,
    },

    /// Remove content units from a repo's latest version and republish
    RemoveContent {
        #[arg(long)]
        server: String,

        #[arg(long)]
        repo: String,

        /// Href of a content unit to remove; repeatable
        #[arg(long = "content-href", required = true)]
        content_hrefs: Vec<String>,

        /// Publish even if the removal created no new version
        #[arg(long)]
        force_publish: bool,
    },
}

/// Which configured task `sync` runs. Exactly one must be given.
#[derive(Args, Debug, PartialEq, Eq)]
#[group(required = true, multiple = false)]
pub struct SyncTarget {
    /// Repo group to sync
    #[arg(long)]
    pub group: Option<String>,

    /// Snapshot the server's repos
    #[arg(long)]
    pub snapshot: bool,

    /// Register repos from the server's primary
    #[arg(long)]
    pub config_registration: bool,
}

impl SyncTarget {
    pub fn task(&self) -> TaskKind {
        match &self.group {
            Some(group) => TaskKind::RepoGroupSync {
                group: group.clone(),
            },
            None if self.snapshot => TaskKind::Snapshot,
            None => TaskKind::ConfigRegistration,
        }
    }
}
