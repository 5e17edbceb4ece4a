//! Error types for the message bus.

/// Errors raised by the in-process broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The topic has never been created.
    #[error("topic not found: {0}")]
    TopicNotFound(String),

    /// The subscription has never been created on the topic.
    #[error("subscription not found: {topic}/{subscription}")]
    SubscriptionNotFound {
        /// Topic name.
        topic: String,
        /// Subscription name.
        subscription: String,
    },

    /// The message was already settled, or its lock was never issued.
    #[error("message lock {0} is not held")]
    LockLost(u64),
}

/// Errors returned by a [`Publisher`](crate::Publisher).
///
/// The outbox processor treats every variant except `Cancelled` as a
/// transient failure of that row.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The in-process broker refused the message.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The HTTP request could not be completed.
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The HTTP endpoint answered with a non-success status.
    #[error("endpoint rejected event with status {status}")]
    Rejected {
        /// HTTP status code returned by the endpoint.
        status: u16,
    },

    /// Shutdown was requested while the publish was in flight.
    #[error("publish cancelled by shutdown")]
    Cancelled,
}

/// Failure reported by an event handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    /// Creates a handler error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// Wraps any displayable error.
    pub fn from_err(err: impl std::fmt::Display) -> Self {
        Self(err.to_string())
    }
}

/// Errors returned by [`EventRouter::route`](crate::EventRouter::route).
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// No handler is registered for the tag. Redelivery cannot fix this.
    #[error("no handler registered for event type {0}")]
    UnknownEventType(String),

    /// The payload does not match the registered event type.
    #[error("failed to deserialize {event_type}: {source}")]
    Decode {
        /// The tag the payload was decoded as.
        event_type: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The handler ran and failed.
    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),
}
