//! Error types for the outbox layer.

use scholar_db::DbError;

/// Errors that can occur during outbox store operations.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    /// A database operation failed.
    #[error("outbox database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("outbox serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The pooled connection or its blocking task failed.
    #[error("outbox connection error: {0}")]
    Connection(#[from] DbError),
}

/// Reasons an outbox payload can never be published.
///
/// The display text is what lands in `outbox_messages.error`.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Payload is null or empty")]
    EmptyPayload,

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Deserialized event is null")]
    NullEvent,

    #[error("Failed to deserialize {event_type}: {source}")]
    Shape {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}
