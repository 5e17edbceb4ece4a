//! Backoff policy for failed notifications.
//!
//! A Failed notification becomes eligible again at
//! `created_at + 2^retry_count minutes`. The delay is measured from creation,
//! not from the last failure, and is not capped here; the retry loop decides
//! how many rows to re-arm per pass.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use scholar_types::NotificationStatus;

use crate::error::NotifyError;
use crate::model::Notification;
use crate::store;

/// Earliest time a notification with `retry_count` failures may be retried.
///
/// Saturates at the maximum representable time instead of overflowing.
pub fn next_retry_time(created_at: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
    2i64.checked_pow(retry_count)
        .and_then(Duration::try_minutes)
        .and_then(|delay| created_at.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn is_retry_eligible(notification: &Notification, now: DateTime<Utc>) -> bool {
    notification.status == NotificationStatus::Failed
        && now >= next_retry_time(notification.created_at, notification.retry_count)
}

/// Re-arms up to `limit` due Failed rows back to Pending.
///
/// Returns how many rows were re-armed. Rows changed concurrently are
/// skipped and picked up on a later pass.
pub fn rearm_eligible(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: usize,
) -> Result<usize, NotifyError> {
    let mut rearmed = 0;
    for notification in store::list_retry_due(conn, now, limit)? {
        if store::rearm(conn, notification.id, notification.version, now)? {
            tracing::debug!(
                notification_id = %notification.id,
                retry_count = notification.retry_count,
                "notification re-armed for retry"
            );
            rearmed += 1;
        }
    }
    Ok(rearmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 1, h, m, s)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn delay_doubles_per_retry() {
        let created = at(8, 0, 0);
        assert_eq!(next_retry_time(created, 0), at(8, 1, 0));
        assert_eq!(next_retry_time(created, 1), at(8, 2, 0));
        assert_eq!(next_retry_time(created, 2), at(8, 4, 0));
        assert_eq!(next_retry_time(created, 5), at(8, 32, 0));
    }

    #[test]
    fn next_retry_time_is_monotonic() {
        let created = at(8, 0, 0);
        let mut previous = next_retry_time(created, 0);
        for count in 1..80 {
            let next = next_retry_time(created, count);
            assert!(next >= previous, "retry {count} went backwards");
            previous = next;
        }
    }

    #[test]
    fn huge_retry_counts_saturate() {
        assert_eq!(next_retry_time(at(8, 0, 0), 200), DateTime::<Utc>::MAX_UTC);
    }
}
