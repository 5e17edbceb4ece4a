//! Notification status machine, delivery channels and priorities.

use serde::{Deserialize, Serialize};

/// Delivery status of a notification.
///
/// Legal transitions:
///
/// | From | To |
/// |------|----|
/// | `Pending` | `Processing`, `Cancelled` |
/// | `Processing` | `Sent`, `Delivered`, `Failed`, `Cancelled` |
/// | `Sent` | `Delivered` |
/// | `Failed` | `Pending`, `Cancelled` |
/// | `Delivered`, `Cancelled` | none |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NotificationStatus {
    /// Waiting to be claimed by a dispatcher.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Handed to the outward channel.
    Sent,
    /// Confirmed as delivered to the recipient.
    Delivered,
    /// The last delivery attempt failed; may be re-armed by the retry loop.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
}

impl NotificationStatus {
    /// All statuses, in declaration order.
    pub const ALL: [NotificationStatus; 6] = [
        Self::Pending,
        Self::Processing,
        Self::Sent,
        Self::Delivered,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Returns the canonical string label stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::Sent => "Sent",
            Self::Delivered => "Delivered",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Whether a row in this status may move to `next`.
    pub fn can_transition_to(self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Sent)
                | (Processing, Delivered)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Sent, Delivered)
                | (Failed, Pending)
                | (Failed, Cancelled)
        )
    }

    /// Statuses after which the notification is never dispatched again.
    ///
    /// These are the rows the cleanup loop is allowed to purge.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Sent | Self::Delivered | Self::Cancelled)
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NotificationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Processing" => Ok(Self::Processing),
            "Sent" => Ok(Self::Sent),
            "Delivered" => Ok(Self::Delivered),
            "Failed" => Ok(Self::Failed),
            "Cancelled" => Ok(Self::Cancelled),
            _ => Err(ParseEnumError::new("notification status", s)),
        }
    }
}

/// Outward channel a notification is delivered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationChannel {
    Email,
    Sms,
    Push,
    InApp,
}

impl NotificationChannel {
    /// Returns the canonical string label stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "Email",
            Self::Sms => "Sms",
            Self::Push => "Push",
            Self::InApp => "InApp",
        }
    }
}

impl std::fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NotificationChannel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Email" => Ok(Self::Email),
            "Sms" => Ok(Self::Sms),
            "Push" => Ok(Self::Push),
            "InApp" => Ok(Self::InApp),
            _ => Err(ParseEnumError::new("notification channel", s)),
        }
    }
}

/// Dispatch priority. Higher priorities are claimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum NotificationPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl NotificationPriority {
    /// Returns the canonical string label stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Normal => "Normal",
            Self::High => "High",
            Self::Critical => "Critical",
        }
    }

    /// Numeric rank used for ordering claims (`Critical` = 3).
    pub fn rank(self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

impl std::fmt::Display for NotificationPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NotificationPriority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Low" => Ok(Self::Low),
            "Normal" => Ok(Self::Normal),
            "High" => Ok(Self::High),
            "Critical" => Ok(Self::Critical),
            _ => Err(ParseEnumError::new("notification priority", s)),
        }
    }
}

/// Error returned when a stored label does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The offending input.
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
