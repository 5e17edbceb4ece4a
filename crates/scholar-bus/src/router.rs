//! Event-type tag → typed handler dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use scholar_types::DomainEvent;

use crate::envelope::Envelope;
use crate::error::{HandlerError, RouteError};

/// Delivery metadata passed to every handler alongside the decoded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    /// Outbox row id; stable across redeliveries.
    pub message_id: String,
    pub event_type: String,
    /// 1 on the first delivery.
    pub delivery_count: u32,
    pub published_at: DateTime<Utc>,
}

impl MessageContext {
    pub fn from_envelope(envelope: &Envelope, delivery_count: u32) -> Self {
        Self {
            message_id: envelope.message_id.clone(),
            event_type: envelope.event_type.clone(),
            delivery_count,
            published_at: envelope.published_at,
        }
    }
}

/// Handles one concrete event type.
///
/// Returning `Err` asks for redelivery. Handlers run at least once per
/// message and must be idempotent.
#[async_trait]
pub trait EventHandler<E: DomainEvent>: Send + Sync {
    async fn handle(&self, event: E, ctx: &MessageContext) -> Result<(), HandlerError>;
}

type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;
type Route =
    Arc<dyn Fn(&str, MessageContext) -> Result<HandlerFuture, serde_json::Error> + Send + Sync>;

/// Routing table built once at startup and shared read-only afterwards.
#[derive(Clone, Default)]
pub struct EventRouter {
    routes: HashMap<&'static str, Route>,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("event_types", &self.event_types())
            .finish()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `E::EVENT_TYPE`.
    ///
    /// `factory` is called once per message, so handlers carry no state
    /// between deliveries. Registering the same tag twice replaces the
    /// earlier handler.
    pub fn register<E, H, F>(&mut self, factory: F) -> &mut Self
    where
        E: DomainEvent,
        H: EventHandler<E> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let route: Route = Arc::new(
            move |payload: &str, ctx: MessageContext| -> Result<HandlerFuture, serde_json::Error> {
                let event: E = serde_json::from_str(payload)?;
                let handler = factory();
                let fut: HandlerFuture =
                    Box::pin(async move { handler.handle(event, &ctx).await });
                Ok(fut)
            },
        );

        if self.routes.insert(E::EVENT_TYPE, route).is_some() {
            tracing::warn!(event_type = E::EVENT_TYPE, "replaced existing event handler");
        }
        self
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.routes.contains_key(event_type)
    }

    /// Registered tags, sorted.
    pub fn event_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.routes.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Decodes `payload` as the type registered for `event_type` and runs
    /// its handler.
    pub async fn route(
        &self,
        event_type: &str,
        payload: &str,
        ctx: MessageContext,
    ) -> Result<(), RouteError> {
        let route = self
            .routes
            .get(event_type)
            .ok_or_else(|| RouteError::UnknownEventType(event_type.to_string()))?;

        let fut = route(payload, ctx).map_err(|source| RouteError::Decode {
            event_type: event_type.to_string(),
            source,
        })?;
        fut.await?;
        Ok(())
    }
}
