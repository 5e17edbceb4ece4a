//! Notification entity and its construction parameters.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use scholar_types::{NotificationChannel, NotificationPriority, NotificationStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who a notification goes to. Stored as JSON in `recipient_json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Recipient {
    pub fn email(address: impl Into<String>) -> Self {
        Self {
            email: Some(address.into()),
            ..Self::default()
        }
    }

    pub fn phone(number: impl Into<String>) -> Self {
        Self {
            phone: Some(number.into()),
            ..Self::default()
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// The address a channel delivers to, if the recipient has one.
    pub fn address_for(&self, channel: NotificationChannel) -> Option<&str> {
        match channel {
            NotificationChannel::Email => self.email.as_deref(),
            NotificationChannel::Sms => self.phone.as_deref(),
            NotificationChannel::Push => self.device_token.as_deref(),
            NotificationChannel::InApp => self.user_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationContent {
    pub subject: Option<String>,
    pub body: String,
    /// Template key for channels that render server-side.
    pub template: Option<String>,
}

impl NotificationContent {
    pub fn new(subject: Option<String>, body: impl Into<String>) -> Self {
        Self {
            subject,
            body: body.into(),
            template: None,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }
}

/// A stored notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: Uuid,
    /// Key tying the notification to whatever caused it (for the relay,
    /// the outbox message id). Used to deduplicate redelivered events.
    pub correlation_id: Option<String>,
    pub channel: NotificationChannel,
    pub recipient: Recipient,
    pub content: NotificationContent,
    pub priority: NotificationPriority,
    pub status: NotificationStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// Time of the last status transition.
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub version: i64,
}

impl Notification {
    pub fn is_ready_to_send(&self, now: DateTime<Utc>) -> bool {
        self.status == NotificationStatus::Pending
            && self.scheduled_at.map_or(true, |at| at <= now)
    }
}

/// Parameters for a new notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub correlation_id: Option<String>,
    pub channel: NotificationChannel,
    pub recipient: Recipient,
    pub content: NotificationContent,
    pub priority: NotificationPriority,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

impl NewNotification {
    pub fn new(
        channel: NotificationChannel,
        recipient: Recipient,
        content: NotificationContent,
    ) -> Self {
        Self {
            correlation_id: None,
            channel,
            recipient,
            content,
            priority: NotificationPriority::default(),
            scheduled_at: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
