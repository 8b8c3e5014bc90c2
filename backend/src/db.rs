//! Postgres pool for the durable store.

use crate::config::Config;
use crate::error::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Connect to the store database.
///
/// Short-lived commands (`status`, `sync`) share this with the long-running
/// services, so the pool starts empty and grows on demand.
pub async fn create_pool(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections.max(1))
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(300))
        .connect(&config.database_url)
        .await?;

    tracing::debug!(
        "Database pool ready (max {} connections)",
        config.db_max_connections
    );
    Ok(pool)
}
