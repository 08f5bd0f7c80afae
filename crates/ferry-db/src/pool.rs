//! Process-wide PostgreSQL pool
//!
//! The pool is created lazily on first use and kept for the lifetime of the process.
//! Stores receive a clone of the handle, so tests can construct stores against any pool
//! (or use the in-memory stores) without touching the shared one.

use anyhow::{Context, Result};
use ferry_core::BaseConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::Path;
use std::time::Duration;
use tokio::sync::OnceCell;

static SHARED_POOL: OnceCell<PgPool> = OnceCell::const_new();

/// Open a new connection pool
pub async fn connect(database_url: &str, max_connections: u32, timeout: Duration) -> Result<PgPool> {
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(timeout)
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!(max_connections, "Database connected successfully");
    Ok(pool)
}

/// Get the shared pool, connecting on first call. Concurrent first callers wait for the
/// same connection attempt; a failed attempt leaves the cell empty so a later call retries.
pub async fn shared_pool(config: &BaseConfig) -> Result<PgPool> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not configured")?;

    let pool = SHARED_POOL
        .get_or_try_init(|| {
            connect(
                url,
                config.db_max_connections,
                Duration::from_secs(config.db_timeout_seconds),
            )
        })
        .await?;

    Ok(pool.clone())
}

/// Run pending migrations from the workspace `migrations/` directory
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let migrations_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../migrations");
    let migrator = sqlx::migrate::Migrator::new(migrations_dir)
        .await
        .context("Failed to load migrations")?;
    migrator
        .run(pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");
    Ok(())
}
