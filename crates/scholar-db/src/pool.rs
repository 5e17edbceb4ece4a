//! The shared SQLite pool used by the pollers, the consumer and `/health`.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

/// Pool size and lock wait, taken from the `[database]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a statement waits on the writer lock before `SQLITE_BUSY`.
    /// The outbox processor, the dispatcher and the application writer all
    /// contend for it.
    pub busy_timeout_ms: u64,
    pub pool_max_size: u32,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
        }
    }
}

pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Applies the relay's session settings to a freshly opened connection.
///
/// Outbox rows are written by another process, so WAL is required for the
/// pollers to read while it commits. `memory` is tolerated for `:memory:`.
fn prepare_connection(conn: &mut Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    if !matches!(mode.as_str(), "wal" | "memory") {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!("journal_mode stayed {mode}, relay needs wal")),
        ));
    }
    conn.execute_batch(&format!(
        "PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = {busy_timeout_ms};"
    ))
}

/// Opens the relay database at `db_path`.
///
/// A `:memory:` path gives every pooled connection its own empty database,
/// so tests that share rows across connections use a temp file instead.
///
/// # Errors
///
/// Returns `PoolError::PoolInit` when the first connection cannot be opened
/// or prepared.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    let busy_timeout_ms = settings.busy_timeout_ms;
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(move |conn| prepare_connection(conn, busy_timeout_ms));

    let pool = Pool::builder()
        .max_size(settings.pool_max_size)
        .build(manager)?;
    tracing::debug!(
        path = db_path,
        pool_max_size = settings.pool_max_size,
        busy_timeout_ms,
        "relay database pool ready"
    );
    Ok(pool)
}
