//! Data model for servers, repos, job runs and remote tasks.

pub mod health;
pub mod job_run;
pub mod remote_task;
pub mod repo;
pub mod server;
pub mod transition;
