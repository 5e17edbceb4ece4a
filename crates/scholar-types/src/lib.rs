//! Shared types for the Scholar event relay.
//!
//! This crate holds the definitions every other crate in the workspace agrees
//! on: the notification status machine and its channel/priority enums, the
//! [`DomainEvent`] capability trait, and the school domain events that travel
//! through the outbox.
//!
//! Nothing in here touches storage or the network. Keeping these types in a
//! leaf crate lets the outbox, the bus and the notification queue share them
//! without depending on each other.

mod events;
mod notification;

pub use events::{
    AttendanceMarkedEvent, AttendanceStatus, DomainEvent, FeePaymentReceivedEvent,
    NotificationCreatedEvent, StudentEnrolledEvent,
};
pub use notification::{
    NotificationChannel, NotificationPriority, NotificationStatus, ParseEnumError,
};

/// Maximum number of characters kept when persisting a failure message.
pub const MAX_ERROR_LENGTH: usize = 2000;

/// Truncates an error message to at most `max_chars` characters.
///
/// Truncation happens on a character boundary, so multi-byte text never
/// produces an invalid string.
pub fn truncate_error(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => message[..byte_idx].to_string(),
        None => message.to_string(),
    }
}
