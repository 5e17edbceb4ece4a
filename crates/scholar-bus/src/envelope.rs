//! The unit of transfer between the outbox and the broker.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Custom property carrying the event-type tag.
pub const EVENT_TYPE_PROPERTY: &str = "EventType";
/// Custom property carrying the publish timestamp (RFC 3339).
pub const PUBLISHED_AT_PROPERTY: &str = "PublishedAt";
/// Custom property carrying the outbox row id, used as the idempotency key.
pub const MESSAGE_ID_PROPERTY: &str = "MessageId";
/// Content type of every envelope body.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A serialised event plus its routing metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Outbox row id. Stable across redeliveries of the same row.
    pub message_id: String,
    /// Event-type tag, e.g. `NotificationCreatedEvent`.
    pub event_type: String,
    /// When the processor handed the envelope to the publisher.
    pub published_at: DateTime<Utc>,
    /// Always [`CONTENT_TYPE_JSON`].
    pub content_type: String,
    /// Raw JSON payload.
    pub body: String,
}

impl Envelope {
    pub fn new(
        message_id: impl Into<String>,
        event_type: impl Into<String>,
        body: impl Into<String>,
        published_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            event_type: event_type.into(),
            published_at,
            content_type: CONTENT_TYPE_JSON.to_string(),
            body: body.into(),
        }
    }

    /// Custom properties attached to the broker message.
    pub fn properties(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            (EVENT_TYPE_PROPERTY, self.event_type.clone()),
            (
                PUBLISHED_AT_PROPERTY,
                self.published_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            (MESSAGE_ID_PROPERTY, self.message_id.clone()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn properties_carry_routing_metadata() {
        let published_at = Utc
            .with_ymd_and_hms(2026, 3, 4, 10, 30, 0)
            .single()
            .expect("valid timestamp");
        let envelope = Envelope::new("m-1", "StudentEnrolledEvent", "{}", published_at);

        let props = envelope.properties();
        assert_eq!(props[EVENT_TYPE_PROPERTY], "StudentEnrolledEvent");
        assert_eq!(props[PUBLISHED_AT_PROPERTY], "2026-03-04T10:30:00.000Z");
        assert_eq!(props[MESSAGE_ID_PROPERTY], "m-1");
        assert_eq!(envelope.content_type, CONTENT_TYPE_JSON);
    }
}
