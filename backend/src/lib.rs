//! Pulp Manager - Backend Library
//!
//! Schedules and drives repository syncs, snapshots and mirror registration
//! across a fleet of Pulp 3 servers.

#[macro_use]
mod macros;

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod telemetry;

pub use config::Config;
pub use error::{AppError, Result};
