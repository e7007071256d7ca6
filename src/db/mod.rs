//! PostgreSQL persistence for verification jobs.

pub mod queries;

use std::sync::Arc;
use std::time::Duration;

use sqlx::migrate::MigrateError;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::services::encryption::{EncryptionError, EncryptionService};
use queries::PgJobStore;

const MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum DbSetupError {
    #[error("Failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("Failed to run migrations: {0}")]
    Migrate(#[from] MigrateError),

    #[error("Invalid ENCRYPTION_KEY: {0}")]
    Encryption(#[from] EncryptionError),
}

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await
}

/// Apply the embedded `migrations/` directory.
pub async fn run_migrations(pool: &PgPool) -> Result<(), MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Connect, migrate, and wrap the pool in a [`PgJobStore`] that seals
/// subjects with `encryption_key`.
pub async fn connect_job_store(
    database_url: &str,
    encryption_key: &str,
) -> Result<PgJobStore, DbSetupError> {
    let encryption = EncryptionService::new(encryption_key)?;
    let pool = init_pool(database_url)
        .await
        .map_err(DbSetupError::Connect)?;
    run_migrations(&pool).await?;
    tracing::info!(max_connections = MAX_CONNECTIONS, "PostgreSQL job store ready");
    Ok(PgJobStore::new(pool, Arc::new(encryption)))
}
