//! The publish seam between the outbox processor and a transport.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::broker::InMemoryBroker;
use crate::envelope::Envelope;
use crate::error::PublishError;

/// Sends one envelope to the message bus.
///
/// Implementations must honour `cancel` by returning
/// [`PublishError::Cancelled`] instead of starting new work. A successful
/// return means the broker accepted the message; nothing about downstream
/// consumption is implied.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError>;
}

/// Publishes into one topic of an [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct BrokerPublisher {
    broker: InMemoryBroker,
    topic: String,
}

impl BrokerPublisher {
    pub fn new(broker: InMemoryBroker, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Publisher for BrokerPublisher {
    async fn publish(
        &self,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        if cancel.is_cancelled() {
            return Err(PublishError::Cancelled);
        }

        let subscribers = self.broker.send(&self.topic, envelope.clone())?;
        tracing::debug!(
            message_id = %envelope.message_id,
            event_type = %envelope.event_type,
            topic = %self.topic,
            subscribers,
            "published event to broker"
        );
        Ok(())
    }
}
