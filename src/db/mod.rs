//! Postgres persistence: pool, migrations and the store implementations.

use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

pub mod cache_queries;
pub mod queries;

/// Connections beyond one per consumer (ops server, cache writes, submissions).
const SPARE_CONNECTIONS: u32 = 4;

/// Pool sized for `workers` concurrent consumers.
///
/// An exhausted pool surfaces as `sqlx::Error::PoolTimedOut`, which the
/// worker pool treats as a retryable job store failure.
pub async fn init_pool(database_url: &str, workers: usize) -> Result<PgPool, sqlx::Error> {
    let max_connections = u32::try_from(workers)
        .unwrap_or(u32::MAX)
        .saturating_add(SPARE_CONNECTIONS);
    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Apply `migrations/` (jobs table, verification cache).
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    let migrator = sqlx::migrate!("./migrations");
    tracing::debug!(count = migrator.iter().count(), "Applying migrations");
    migrator
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}
