//! Message bus plumbing for the Scholar event relay.
//!
//! The outbox processor hands serialised events to a [`Publisher`]; the
//! consumer side receives them from a broker subscription and routes each one
//! to the handler registered for its event-type tag.
//!
//! # Pieces
//!
//! | Item | Role |
//! |------|------|
//! | [`Envelope`] | JSON body plus `EventType` / `PublishedAt` / `MessageId` routing metadata |
//! | [`Publisher`] | Object-safe async publish interface used by the outbox processor |
//! | [`BrokerPublisher`] | Publishes into a topic of the in-process [`InMemoryBroker`] |
//! | [`HttpPublisher`] | Publishes by POSTing the envelope to an external endpoint |
//! | [`EventRouter`] | Tag → typed handler table, one fresh handler per message |
//! | [`Consumer`] | Concurrent receive loop with complete / abandon / dead-letter settlement |
//!
//! Delivery is at-least-once end to end. Handlers must tolerate duplicates;
//! the envelope's `MessageId` is the key to deduplicate on.

mod broker;
mod consumer;
mod envelope;
mod error;
mod http;
mod publisher;
mod router;

pub use broker::{DeadLetter, InMemoryBroker, ReceivedMessage, Receiver};
pub use consumer::{
    settle, Consumer, ConsumerConfig, Settlement, DEAD_LETTER_DESERIALIZATION_FAILED,
    DEAD_LETTER_PROCESSING_FAILED,
};
pub use envelope::{
    Envelope, CONTENT_TYPE_JSON, EVENT_TYPE_PROPERTY, MESSAGE_ID_PROPERTY, PUBLISHED_AT_PROPERTY,
};
pub use error::{BrokerError, HandlerError, PublishError, RouteError};
pub use http::HttpPublisher;
pub use publisher::{BrokerPublisher, Publisher};
pub use router::{EventHandler, EventRouter, MessageContext};
