//! SQLite connection pools.
//!
//! SQLite allows only one writer at a time, so [`DbPool`] splits a
//! multi-connection read pool from a single-connection write pool. All
//! check-then-update transactions run on the writer, which serializes writes
//! to the same row without lost updates.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::DbError;

/// Split read/write pool shared across the whole application.
#[derive(Debug, Clone)]
pub struct DbPool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

/// Open a pool for the SQLite database at `database_url`.
///
/// The file is created if missing. `max_connections` caps the reader pool;
/// the writer always holds exactly one connection.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, DbError> {
    info!("Connecting to database (max_connections={})", max_connections);

    let base_opts = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
        .create_if_missing(true);

    let writer = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(base_opts.clone())
        .await?;

    let reader = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(base_opts.read_only(true))
        .await?;

    Ok(DbPool { reader, writer })
}

/// Open a private in-memory database with migrations applied.
///
/// A single connection backs both roles; the database lives as long as the
/// pool does.
pub async fn create_in_memory_pool() -> Result<DbPool, DbError> {
    let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(opts)
        .await?;

    let db = DbPool { reader: pool.clone(), writer: pool };
    run_migrations(&db).await?;
    Ok(db)
}

/// Run embedded SQLx migrations located in `./migrations` (relative to the
/// workspace root at build time).
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    info!("Running database migrations");
    sqlx::migrate!("../../migrations").run(&pool.writer).await?;
    Ok(())
}
