pub mod settings;

use chrono::{DateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::sqlite::SqliteConnection;
use diesel::Connection;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use thiserror::Error;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

/// Async handle over the single durable SQLite store.
///
/// SQLite has no native async driver; Diesel's `SyncConnectionWrapper` moves
/// blocking work onto a dedicated thread so queue and retry code can stay
/// fully async.
pub type DbConnection = SyncConnectionWrapper<SqliteConnection>;

/// Error type for durable-store operations.
///
/// Any storage failure is surfaced to the operation that triggered it; the
/// store itself never retries.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database operation failed: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("failed to open database: {0}")]
    Connection(#[from] diesel::ConnectionError),
    #[error("failed to run schema migrations: {0}")]
    Migration(String),
    #[error("invalid persisted value: {0}")]
    InvalidValue(String),
    #[error("failed to encode or decode a JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Opens (creating if needed) the durable store at `path` and brings its
/// schema up to date.
///
/// WAL mode keeps a long-lived worker process and short-lived CLI invocations
/// from blocking each other on the same file.
pub fn open_database(path: &str) -> Result<DbConnection, StorageError> {
    let mut conn = SqliteConnection::establish(path)?;
    conn.batch_execute(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        "#,
    )?;

    run_migrations(&mut conn)?;
    Ok(SyncConnectionWrapper::new(conn))
}

/// Opens a fresh in-memory store with the full schema applied.
///
/// Each call returns an isolated database; state is gone when the connection
/// drops. Used by tests and ephemeral tooling.
pub fn open_in_memory() -> Result<DbConnection, StorageError> {
    let mut conn = SqliteConnection::establish(":memory:")?;
    conn.batch_execute(
        r#"
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        "#,
    )?;

    run_migrations(&mut conn)?;
    Ok(SyncConnectionWrapper::new(conn))
}

fn run_migrations(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| StorageError::Migration(err.to_string()))?;
    Ok(())
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::InvalidValue(format!("timestamp out of range: {ms}")))
}
