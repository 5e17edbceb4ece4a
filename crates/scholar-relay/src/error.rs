//! Error types for relay startup and the maintenance loops.

use scholar_bus::PublishError;
use scholar_db::{DbError, MigrationError, PoolError};
use scholar_notify::NotifyError;
use scholar_outbox::OutboxError;
use thiserror::Error;

use crate::config::ConfigError;

/// Failures that stop the relay from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("failed to get database connection for migrations: {0}")]
    Connection(#[from] r2d2::Error),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// `broker.mode = "http"` without `broker.endpoint`.
    #[error("broker.endpoint is required when broker.mode is \"http\"")]
    MissingEndpoint,

    #[error("failed to build publisher: {0}")]
    Publisher(#[from] PublishError),

    #[error("failed to bind operator endpoint: {0}")]
    Bind(#[source] std::io::Error),

    #[error("operator endpoint failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// Failure inside one pass of a maintenance loop. Logged, never fatal.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Connection(#[from] DbError),
}
