//! Event-type tag → typed validator table used by the processor.

use std::collections::HashMap;

use scholar_types::{
    AttendanceMarkedEvent, DomainEvent, FeePaymentReceivedEvent, NotificationCreatedEvent,
    StudentEnrolledEvent,
};
use serde_json::Value;

use crate::error::DecodeError;

type Validator = fn(Value) -> Result<(), serde_json::Error>;

fn check_shape<E: DomainEvent>(value: Value) -> Result<(), serde_json::Error> {
    serde_json::from_value::<E>(value).map(drop)
}

/// Validates outbox payloads against the type registered for their tag.
///
/// Built once at startup. Only [`DomainEvent`] types can be registered.
#[derive(Debug, Clone, Default)]
pub struct EventRegistry {
    validators: HashMap<&'static str, Validator>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event the school write path raises.
    pub fn school_events() -> Self {
        let mut registry = Self::new();
        registry
            .register::<NotificationCreatedEvent>()
            .register::<StudentEnrolledEvent>()
            .register::<AttendanceMarkedEvent>()
            .register::<FeePaymentReceivedEvent>();
        registry
    }

    pub fn register<E: DomainEvent>(&mut self) -> &mut Self {
        self.validators.insert(E::EVENT_TYPE, check_shape::<E>);
        self
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.validators.contains_key(event_type)
    }

    /// Checks that `payload` decodes as the type registered for `event_type`.
    ///
    /// The payload itself is published untouched; decoding only proves it is
    /// a well-formed event.
    ///
    /// # Errors
    ///
    /// Every [`DecodeError`] is permanent: retrying the same row cannot
    /// succeed.
    pub fn validate(&self, event_type: &str, payload: &str) -> Result<(), DecodeError> {
        if payload.trim().is_empty() {
            return Err(DecodeError::EmptyPayload);
        }
        let validator = self
            .validators
            .get(event_type)
            .ok_or_else(|| DecodeError::UnknownEventType(event_type.to_string()))?;

        let shape = |source: serde_json::Error| DecodeError::Shape {
            event_type: event_type.to_string(),
            source,
        };
        let value: Value = serde_json::from_str(payload).map_err(shape)?;
        if value.is_null() {
            return Err(DecodeError::NullEvent);
        }
        validator(value).map_err(shape)
    }
}
