//! Error types for the notification layer.

use scholar_db::DbError;
use scholar_types::NotificationStatus;
use uuid::Uuid;

/// Errors that can occur during notification operations.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("notification json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("notification connection error: {0}")]
    Connection(#[from] DbError),

    #[error("notification not found: {0}")]
    NotFound(Uuid),

    /// The row is not in a status that may move to `to`.
    #[error("notification {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: NotificationStatus,
        to: NotificationStatus,
    },
}

/// Failure reported by a [`NotificationSender`](crate::NotificationSender).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("recipient has no address for the {0} channel")]
    MissingAddress(scholar_types::NotificationChannel),

    #[error("channel provider failed: {0}")]
    Provider(String),
}
