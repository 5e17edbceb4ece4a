//! Subscription consumer with bounded concurrency and dead-lettering.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::broker::{ReceivedMessage, Receiver};
use crate::error::{HandlerError, RouteError};
use crate::router::{EventRouter, MessageContext};

/// Dead-letter reason for messages whose handler kept failing.
pub const DEAD_LETTER_PROCESSING_FAILED: &str = "ProcessingFailed";
/// Dead-letter reason for payloads that do not decode as their tag's type.
pub const DEAD_LETTER_DESERIALIZATION_FAILED: &str = "DeserializationFailed";

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Upper bound on messages being handled at once.
    pub max_concurrent: usize,
    /// Deliveries after which a failing message is dead-lettered.
    pub max_delivery_attempts: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_delivery_attempts: 3,
        }
    }
}

/// How a received message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Completed,
    Abandoned,
    DeadLettered,
}

/// Receives from one subscription and dispatches through an [`EventRouter`].
pub struct Consumer {
    receiver: Receiver,
    router: Arc<EventRouter>,
    config: ConsumerConfig,
}

impl Consumer {
    pub fn new(receiver: Receiver, router: Arc<EventRouter>, config: ConsumerConfig) -> Self {
        Self {
            receiver,
            router,
            config,
        }
    }

    /// Runs until `shutdown` fires, then waits for in-flight handlers.
    pub async fn run(self, shutdown: CancellationToken) {
        let max_concurrent = self.config.max_concurrent.max(1);
        tracing::info!(
            topic = self.receiver.topic(),
            subscription = self.receiver.subscription(),
            max_concurrent,
            max_delivery_attempts = self.config.max_delivery_attempts,
            "event consumer started"
        );

        let limiter = Arc::new(Semaphore::new(max_concurrent));
        let mut in_flight = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let Some(message) = self.receiver.receive(&shutdown).await else {
                break;
            };

            let receiver = self.receiver.clone();
            let router = self.router.clone();
            let max_attempts = self.config.max_delivery_attempts;
            in_flight.spawn(async move {
                let _permit = permit;
                settle(&receiver, &router, message, max_attempts).await
            });

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "message handler task failed");
                }
            }
        }

        tracing::info!(
            in_flight = in_flight.len(),
            "event consumer stopping, draining in-flight messages"
        );
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "message handler task failed");
            }
        }
        tracing::info!("event consumer stopped");
    }
}

/// Routes one message and settles it on the subscription.
///
/// - success, or an unregistered tag: complete
/// - undecodable payload: dead-letter immediately
/// - handler failure or panic: abandon for redelivery until
///   `max_delivery_attempts`, then dead-letter
pub async fn settle(
    receiver: &Receiver,
    router: &EventRouter,
    message: ReceivedMessage,
    max_delivery_attempts: u32,
) -> Settlement {
    let envelope = &message.envelope;
    let ctx = MessageContext::from_envelope(envelope, message.delivery_count);

    // A panicking handler must still release the lock, or the message
    // would never be redelivered.
    let routed = AssertUnwindSafe(router.route(&envelope.event_type, &envelope.body, ctx))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(RouteError::Handler(HandlerError::new(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))))
        });

    let (settlement, result) = match routed {
        Ok(()) => {
            tracing::debug!(
                message_id = %envelope.message_id,
                event_type = %envelope.event_type,
                "event handled"
            );
            (Settlement::Completed, receiver.complete(&message))
        }
        Err(RouteError::UnknownEventType(event_type)) => {
            tracing::warn!(
                message_id = %envelope.message_id,
                event_type = %event_type,
                "no handler for event type, completing message"
            );
            (Settlement::Completed, receiver.complete(&message))
        }
        Err(e @ RouteError::Decode { .. }) => {
            tracing::error!(
                message_id = %envelope.message_id,
                event_type = %envelope.event_type,
                error = %e,
                "event payload could not be decoded, dead-lettering"
            );
            (
                Settlement::DeadLettered,
                receiver.dead_letter(&message, DEAD_LETTER_DESERIALIZATION_FAILED, &e.to_string()),
            )
        }
        Err(RouteError::Handler(e)) if message.delivery_count >= max_delivery_attempts => {
            tracing::error!(
                message_id = %envelope.message_id,
                event_type = %envelope.event_type,
                delivery_count = message.delivery_count,
                error = %e,
                "event handler failed on final attempt, dead-lettering"
            );
            (
                Settlement::DeadLettered,
                receiver.dead_letter(&message, DEAD_LETTER_PROCESSING_FAILED, &e.to_string()),
            )
        }
        Err(RouteError::Handler(e)) => {
            tracing::warn!(
                message_id = %envelope.message_id,
                event_type = %envelope.event_type,
                delivery_count = message.delivery_count,
                error = %e,
                "event handler failed, abandoning for redelivery"
            );
            (Settlement::Abandoned, receiver.abandon(&message))
        }
    };

    if let Err(e) = result {
        tracing::warn!(
            message_id = %envelope.message_id,
            error = %e,
            "failed to settle message"
        );
    }
    settlement
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
