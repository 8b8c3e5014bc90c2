//! Scheduling, dispatch and sync services.

pub mod concurrency_gate;
pub mod credential_service;
pub mod fleet_config_service;
pub mod health_service;
pub mod job_queue;
pub mod metrics_service;
pub mod pulp_client;
pub mod repo_selector_service;
pub mod retry;
pub mod scheduler_service;
pub mod store;
pub mod sync_worker;
pub mod sync_workflow;
pub mod task_monitor;
