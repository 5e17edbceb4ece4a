//! Handlers turning school domain events into notifications.
//!
//! Every handler uses the envelope's message id as the notification's
//! correlation id. The id is unique in the notification table and the insert
//! skips on conflict, so a redelivered or republished event never produces a
//! second message to a guardian.

use async_trait::async_trait;
use scholar_bus::{EventHandler, EventRouter, HandlerError, MessageContext};
use scholar_notify::{
    NewNotification, NotificationContent, NotificationQueue, NotifyError, Recipient,
};
use scholar_types::{
    AttendanceMarkedEvent, AttendanceStatus, FeePaymentReceivedEvent, NotificationChannel,
    NotificationCreatedEvent, NotificationPriority, NotificationStatus, StudentEnrolledEvent,
};

/// Builds the routing table for every school event the relay consumes.
pub fn school_router(queue: NotificationQueue) -> EventRouter {
    let mut router = EventRouter::new();

    let q = queue.clone();
    router.register::<NotificationCreatedEvent, _, _>(move || NotificationCreatedHandler {
        queue: q.clone(),
    });
    let q = queue.clone();
    router.register::<StudentEnrolledEvent, _, _>(move || EnrollmentHandler { queue: q.clone() });
    let q = queue.clone();
    router.register::<AttendanceMarkedEvent, _, _>(move || AttendanceHandler { queue: q.clone() });
    router.register::<FeePaymentReceivedEvent, _, _>(move || FeePaymentHandler {
        queue: queue.clone(),
    });

    router
}

/// Queues `new` keyed by the message id. Redeliveries of the same message,
/// including concurrent ones, find the existing row and do nothing.
async fn enqueue_once(
    queue: &NotificationQueue,
    ctx: &MessageContext,
    new: NewNotification,
) -> Result<(), HandlerError> {
    let inserted = queue
        .enqueue_once(new.correlation_id(ctx.message_id.clone()))
        .await
        .map_err(HandlerError::from_err)?;
    match inserted {
        Some(notification) => tracing::info!(
            message_id = %ctx.message_id,
            event_type = %ctx.event_type,
            notification_id = %notification.id,
            channel = %notification.channel,
            "notification queued from event"
        ),
        None => tracing::debug!(
            message_id = %ctx.message_id,
            event_type = %ctx.event_type,
            "event already produced a notification, skipping"
        ),
    }
    Ok(())
}

/// Formats an amount in minor units as `major.minor`.
fn format_amount(amount_minor: i64) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let abs = amount_minor.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// The application stored a notification row itself; wake the dispatcher.
pub struct NotificationCreatedHandler {
    queue: NotificationQueue,
}

#[async_trait]
impl EventHandler<NotificationCreatedEvent> for NotificationCreatedHandler {
    async fn handle(
        &self,
        event: NotificationCreatedEvent,
        ctx: &MessageContext,
    ) -> Result<(), HandlerError> {
        match self.queue.get(event.notification_id).await {
            Ok(notification) if notification.status == NotificationStatus::Pending => {
                self.queue.notify_available(1);
                Ok(())
            }
            Ok(notification) => {
                tracing::debug!(
                    notification_id = %notification.id,
                    status = %notification.status,
                    "notification already past pending"
                );
                Ok(())
            }
            // The row may not be visible yet; redelivery retries the lookup.
            Err(NotifyError::NotFound(id)) => Err(HandlerError::new(format!(
                "notification {id} not found for message {}",
                ctx.message_id
            ))),
            Err(e) => Err(HandlerError::from_err(e)),
        }
    }
}

/// Welcomes the guardian of a newly enrolled student.
pub struct EnrollmentHandler {
    queue: NotificationQueue,
}

#[async_trait]
impl EventHandler<StudentEnrolledEvent> for EnrollmentHandler {
    async fn handle(
        &self,
        event: StudentEnrolledEvent,
        ctx: &MessageContext,
    ) -> Result<(), HandlerError> {
        let (channel, recipient) = match (&event.guardian_email, &event.guardian_user_id) {
            (Some(email), _) => (NotificationChannel::Email, Recipient::email(email.clone())),
            (None, Some(user_id)) => (NotificationChannel::InApp, Recipient::user(user_id.clone())),
            (None, None) => {
                tracing::info!(
                    student_id = %event.student_id,
                    "no guardian contact on enrollment, nothing to send"
                );
                return Ok(());
            }
        };

        let content = NotificationContent::new(
            Some(format!("Welcome to {}", event.class_name)),
            format!(
                "{} has been enrolled in {}.",
                event.student_name, event.class_name
            ),
        )
        .with_template("enrollment-welcome");

        let new = NewNotification::new(channel, recipient, content)
            .metadata("studentId", event.student_id.to_string())
            .metadata("className", event.class_name.clone());
        enqueue_once(&self.queue, ctx, new).await
    }
}

/// Texts the guardian when a student is marked absent.
pub struct AttendanceHandler {
    queue: NotificationQueue,
}

#[async_trait]
impl EventHandler<AttendanceMarkedEvent> for AttendanceHandler {
    async fn handle(
        &self,
        event: AttendanceMarkedEvent,
        ctx: &MessageContext,
    ) -> Result<(), HandlerError> {
        if event.status != AttendanceStatus::Absent {
            return Ok(());
        }
        let Some(phone) = event.guardian_phone.clone() else {
            tracing::info!(
                student_id = %event.student_id,
                "no guardian phone on absence, nothing to send"
            );
            return Ok(());
        };

        let content = NotificationContent::new(
            None,
            format!(
                "{} was marked absent on {}.",
                event.student_name,
                event.date.format("%Y-%m-%d")
            ),
        );
        let new = NewNotification::new(NotificationChannel::Sms, Recipient::phone(phone), content)
            .priority(NotificationPriority::High)
            .metadata("studentId", event.student_id.to_string())
            .metadata("date", event.date.to_string());
        enqueue_once(&self.queue, ctx, new).await
    }
}

/// Emails a receipt for a fee payment.
pub struct FeePaymentHandler {
    queue: NotificationQueue,
}

#[async_trait]
impl EventHandler<FeePaymentReceivedEvent> for FeePaymentHandler {
    async fn handle(
        &self,
        event: FeePaymentReceivedEvent,
        ctx: &MessageContext,
    ) -> Result<(), HandlerError> {
        let Some(email) = event.guardian_email.clone() else {
            tracing::info!(
                receipt_number = %event.receipt_number,
                "no guardian email on payment, nothing to send"
            );
            return Ok(());
        };

        let content = NotificationContent::new(
            Some(format!("Payment received ({})", event.receipt_number)),
            format!(
                "We received {} {} against receipt {}.",
                format_amount(event.amount_minor),
                event.currency,
                event.receipt_number
            ),
        )
        .with_template("fee-receipt");
        let new = NewNotification::new(NotificationChannel::Email, Recipient::email(email), content)
            .metadata("studentId", event.student_id.to_string())
            .metadata("receiptNumber", event.receipt_number.clone());
        enqueue_once(&self.queue, ctx, new).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_render_with_two_decimals() {
        assert_eq!(format_amount(150_000), "1500.00");
        assert_eq!(format_amount(123_405), "1234.05");
        assert_eq!(format_amount(7), "0.07");
        assert_eq!(format_amount(-250), "-2.50");
    }

    #[test]
    fn router_covers_every_school_event() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("router.db");
        let pool = scholar_db::create_pool(
            path.to_str().expect("utf-8 path"),
            scholar_db::DbRuntimeSettings::default(),
        )
        .expect("pool");
        let queue = NotificationQueue::new(pool, std::time::Duration::from_secs(1));

        let router = school_router(queue);
        assert_eq!(
            router.event_types(),
            vec![
                "AttendanceMarkedEvent",
                "FeePaymentReceivedEvent",
                "NotificationCreatedEvent",
                "StudentEnrolledEvent",
            ]
        );
    }
}
