//! The outward delivery seam.

use async_trait::async_trait;
use scholar_types::NotificationChannel;

use crate::error::SendError;
use crate::model::Notification;

/// What the channel reported after a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryReceipt {
    /// Accepted by the provider; delivery not yet confirmed.
    Sent,
    /// Confirmed delivered to the recipient.
    Delivered,
}

/// Delivers one notification through its channel.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<DeliveryReceipt, SendError>;
}

/// Sender that only logs. In-app notifications count as delivered the moment
/// they are recorded; other channels stop at Sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
    async fn send(&self, notification: &Notification) -> Result<DeliveryReceipt, SendError> {
        let address = notification
            .recipient
            .address_for(notification.channel)
            .ok_or(SendError::MissingAddress(notification.channel))?;

        tracing::info!(
            notification_id = %notification.id,
            channel = %notification.channel,
            priority = %notification.priority,
            address,
            subject = notification.content.subject.as_deref().unwrap_or(""),
            "notification sent"
        );

        Ok(match notification.channel {
            NotificationChannel::InApp => DeliveryReceipt::Delivered,
            _ => DeliveryReceipt::Sent,
        })
    }
}
