//! Domain events raised by the school administration write path.
//!
//! Each event is serialised to camelCase JSON and stored in the outbox under
//! its [`DomainEvent::EVENT_TYPE`] tag. The tag doubles as the broker routing
//! key, so renaming one is a wire-format change.

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Capability shared by every event that may travel through the outbox.
///
/// Only types implementing this trait can be registered with the outbox
/// registry or the event router, so "is this a domain event" is answered at
/// compile time instead of while draining the outbox.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type tag stored in `outbox_messages.event_type`.
    const EVENT_TYPE: &'static str;
}

/// A notification row was created and is ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationCreatedEvent {
    pub notification_id: Uuid,
}

impl DomainEvent for NotificationCreatedEvent {
    const EVENT_TYPE: &'static str = "NotificationCreatedEvent";
}

/// A student was enrolled into a class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentEnrolledEvent {
    pub student_id: Uuid,
    pub student_name: String,
    pub class_name: String,
    #[serde(default)]
    pub guardian_email: Option<String>,
    #[serde(default)]
    pub guardian_user_id: Option<String>,
}

impl DomainEvent for StudentEnrolledEvent {
    const EVENT_TYPE: &'static str = "StudentEnrolledEvent";
}

/// Attendance outcome recorded for a student on a given day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

/// Attendance was recorded for a student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceMarkedEvent {
    pub student_id: Uuid,
    pub student_name: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    #[serde(default)]
    pub guardian_phone: Option<String>,
}

impl DomainEvent for AttendanceMarkedEvent {
    const EVENT_TYPE: &'static str = "AttendanceMarkedEvent";
}

/// A fee payment was booked against a student account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeePaymentReceivedEvent {
    pub student_id: Uuid,
    pub receipt_number: String,
    /// Amount in minor currency units.
    pub amount_minor: i64,
    pub currency: String,
    #[serde(default)]
    pub guardian_email: Option<String>,
}

impl DomainEvent for FeePaymentReceivedEvent {
    const EVENT_TYPE: &'static str = "FeePaymentReceivedEvent";
}
