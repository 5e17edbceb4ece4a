//! Running pooled SQLite work from async tasks.

use rusqlite::Connection;
use thiserror::Error;

use crate::DbPool;

/// Failures that happen around a blocking database call rather than inside it.
#[derive(Debug, Error)]
pub enum DbError {
    /// No connection could be checked out of the pool.
    #[error("failed to check out database connection: {0}")]
    Pool(#[from] r2d2::Error),

    /// The blocking task panicked or was cancelled.
    #[error("database task did not complete: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Runs `f` with a pooled connection on tokio's blocking thread pool.
///
/// The closure's own error type is kept; pool checkout and join failures are
/// converted into it through `From<DbError>`.
///
/// # Errors
///
/// Returns whatever `f` returns, or a converted [`DbError`].
pub async fn run_blocking<T, E, F>(pool: &DbPool, f: F) -> Result<T, E>
where
    T: Send + 'static,
    E: From<DbError> + Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, E> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|e| E::from(DbError::Pool(e)))?;
        f(&mut conn)
    })
    .await
    .map_err(|e| E::from(DbError::TaskJoin(e)))?
}
