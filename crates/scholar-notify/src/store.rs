//! Persistence operations for the notification table.
//!
//! Every status change is a single conditional `UPDATE` whose `WHERE status
//! IN (...)` clause is derived from [`NotificationStatus::can_transition_to`].
//! When the guard matches no row, the current status is read back to report
//! either [`NotifyError::NotFound`] or [`NotifyError::InvalidTransition`].

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use scholar_db::{format_timestamp, optional_timestamp_column, timestamp_column};
use scholar_types::{truncate_error, NotificationStatus, MAX_ERROR_LENGTH};
use serde::Serialize;
use uuid::Uuid;

use crate::error::NotifyError;
use crate::model::{NewNotification, Notification, NotificationContent};

const COLUMNS: &str = "id, correlation_id, channel, recipient_json, subject, body, template, \
     status, priority, scheduled_at, created_at, sent_at, delivered_at, updated_at, \
     retry_count, error_message, metadata_json, version";

/// Error message recorded on claims that outlived the claim timeout.
pub const CLAIM_EXPIRED_ERROR: &str = "Claim expired before delivery completed";

/// Notification counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    fn slot(&mut self, status: NotificationStatus) -> &mut u64 {
        match status {
            NotificationStatus::Pending => &mut self.pending,
            NotificationStatus::Processing => &mut self.processing,
            NotificationStatus::Sent => &mut self.sent,
            NotificationStatus::Delivered => &mut self.delivered,
            NotificationStatus::Failed => &mut self.failed,
            NotificationStatus::Cancelled => &mut self.cancelled,
        }
    }

    pub fn get(&self, status: NotificationStatus) -> u64 {
        match status {
            NotificationStatus::Pending => self.pending,
            NotificationStatus::Processing => self.processing,
            NotificationStatus::Sent => self.sent,
            NotificationStatus::Delivered => self.delivered,
            NotificationStatus::Failed => self.failed,
            NotificationStatus::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> u64 {
        NotificationStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let retry_count: i64 = row.get(14)?;
    Ok(Notification {
        id: parse_column(row, 0)?,
        correlation_id: row.get(1)?,
        channel: parse_column(row, 2)?,
        recipient: json_column(row, 3)?,
        content: NotificationContent {
            subject: row.get(4)?,
            body: row.get(5)?,
            template: row.get(6)?,
        },
        status: parse_column(row, 7)?,
        priority: parse_column(row, 8)?,
        scheduled_at: optional_timestamp_column(row, 9)?,
        created_at: timestamp_column(row, 10)?,
        sent_at: optional_timestamp_column(row, 11)?,
        delivered_at: optional_timestamp_column(row, 12)?,
        updated_at: timestamp_column(row, 13)?,
        retry_count: u32::try_from(retry_count.max(0)).unwrap_or(u32::MAX),
        error_message: row.get(15)?,
        metadata: json_column::<BTreeMap<String, String>>(row, 16)?,
        version: row.get(17)?,
    })
}

/// Quoted labels of every status allowed to move to `to`.
fn sources_of(to: NotificationStatus) -> String {
    NotificationStatus::ALL
        .iter()
        .filter(|from| from.can_transition_to(to))
        .map(|from| format!("'{}'", from.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn current_status(conn: &Connection, id: Uuid) -> Result<Option<NotificationStatus>, NotifyError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM notifications WHERE id = ?1",
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| s.parse().ok()))
}

fn rejected(conn: &Connection, id: Uuid, to: NotificationStatus) -> NotifyError {
    match current_status(conn, id) {
        Ok(Some(from)) => NotifyError::InvalidTransition { id, from, to },
        Ok(None) => NotifyError::NotFound(id),
        Err(e) => e,
    }
}

fn pending_from(new: &NewNotification, now: DateTime<Utc>) -> Notification {
    Notification {
        id: Uuid::new_v4(),
        correlation_id: new.correlation_id.clone(),
        channel: new.channel,
        recipient: new.recipient.clone(),
        content: new.content.clone(),
        priority: new.priority,
        status: NotificationStatus::Pending,
        scheduled_at: new.scheduled_at.map(|at| at.trunc_subsecs(6)),
        created_at: now,
        sent_at: None,
        delivered_at: None,
        updated_at: now,
        retry_count: 0,
        error_message: None,
        metadata: new.metadata.clone(),
        version: 0,
    }
}

/// Writes `notification`; `conflict_clause` is appended to the INSERT.
/// Returns the number of rows inserted.
fn insert_row(
    conn: &Connection,
    notification: &Notification,
    conflict_clause: &str,
) -> Result<usize, NotifyError> {
    let sql = format!(
        "INSERT INTO notifications (
            id, correlation_id, channel, recipient_json, subject, body, template,
            status, priority, priority_rank, scheduled_at, created_at, updated_at,
            retry_count, metadata_json, version
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12, 0, ?13, 0)
         {conflict_clause}"
    );
    let inserted = conn.execute(
        &sql,
        params![
            notification.id.to_string(),
            notification.correlation_id,
            notification.channel.as_str(),
            serde_json::to_string(&notification.recipient)?,
            notification.content.subject,
            notification.content.body,
            notification.content.template,
            notification.status.as_str(),
            notification.priority.as_str(),
            notification.priority.rank(),
            notification.scheduled_at.map(format_timestamp),
            format_timestamp(notification.created_at),
            serde_json::to_string(&notification.metadata)?,
        ],
    )?;
    Ok(inserted)
}

/// Inserts a Pending notification.
///
/// A `correlation_id` already used by another row is a constraint error;
/// see [`insert_once`] for the idempotent form.
pub fn insert(
    conn: &Connection,
    new: &NewNotification,
    now: DateTime<Utc>,
) -> Result<Notification, NotifyError> {
    // Match the stored precision so the returned value equals a re-read.
    let notification = pending_from(new, now.trunc_subsecs(6));
    insert_row(conn, &notification, "")?;

    tracing::debug!(
        notification_id = %notification.id,
        channel = %notification.channel,
        priority = %notification.priority,
        "notification created"
    );
    Ok(notification)
}

/// Inserts a Pending notification unless one with the same `correlation_id`
/// exists. Returns `None` when it does.
///
/// The check and the insert are one statement, so concurrent callers with
/// the same correlation id create exactly one row.
pub fn insert_once(
    conn: &Connection,
    new: &NewNotification,
    now: DateTime<Utc>,
) -> Result<Option<Notification>, NotifyError> {
    let notification = pending_from(new, now.trunc_subsecs(6));
    let inserted = insert_row(
        conn,
        &notification,
        "ON CONFLICT(correlation_id) DO NOTHING",
    )?;
    if inserted == 0 {
        tracing::debug!(
            correlation_id = notification.correlation_id.as_deref().unwrap_or(""),
            "notification for correlation id already exists"
        );
        return Ok(None);
    }
    tracing::debug!(
        notification_id = %notification.id,
        channel = %notification.channel,
        priority = %notification.priority,
        "notification created"
    );
    Ok(Some(notification))
}

/// Loads one notification.
pub fn get(conn: &Connection, id: Uuid) -> Result<Notification, NotifyError> {
    let sql = format!("SELECT {COLUMNS} FROM notifications WHERE id = ?1");
    conn.query_row(&sql, [id.to_string()], notification_from_row)
        .optional()?
        .ok_or(NotifyError::NotFound(id))
}

/// Every notification created for `correlation_id`, oldest first.
pub fn find_by_correlation(
    conn: &Connection,
    correlation_id: &str,
) -> Result<Vec<Notification>, NotifyError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM notifications
         WHERE correlation_id = ?1
         ORDER BY created_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([correlation_id], notification_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Ids of Pending rows that are due, highest priority first, then oldest.
pub fn ready_candidates(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<Uuid>, NotifyError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM notifications
         WHERE status = 'Pending' AND (scheduled_at IS NULL OR scheduled_at <= ?1)
         ORDER BY priority_rank DESC, created_at ASC, rowid ASC
         LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(
            params![
                format_timestamp(now),
                i64::try_from(limit).unwrap_or(i64::MAX)
            ],
            |row| parse_column::<Uuid>(row, 0),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Number of Pending rows that are due now.
pub fn count_ready(conn: &Connection, now: DateTime<Utc>) -> Result<u64, NotifyError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM notifications
         WHERE status = 'Pending' AND (scheduled_at IS NULL OR scheduled_at <= ?1)",
        [format_timestamp(now)],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or(0))
}

/// Moves a due Pending row to Processing.
///
/// Returns `None` when the row is no longer claimable (another worker won,
/// it was cancelled, or it is not due yet).
pub fn claim(
    conn: &Connection,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<Notification>, NotifyError> {
    let sql = format!(
        "UPDATE notifications
         SET status = 'Processing', updated_at = ?2, version = version + 1
         WHERE id = ?1
           AND status IN ({})
           AND (scheduled_at IS NULL OR scheduled_at <= ?2)
         RETURNING {COLUMNS}",
        sources_of(NotificationStatus::Processing)
    );
    Ok(conn
        .query_row(
            &sql,
            params![id.to_string(), format_timestamp(now)],
            notification_from_row,
        )
        .optional()?)
}

fn transition(
    conn: &Connection,
    id: Uuid,
    to: NotificationStatus,
    set_clause: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<(), NotifyError> {
    let sql = format!(
        "UPDATE notifications
         SET status = '{}', {set_clause}, version = version + 1
         WHERE id = ?1 AND status IN ({})",
        to.as_str(),
        sources_of(to)
    );
    let updated = conn.execute(&sql, params)?;
    if updated == 0 {
        return Err(rejected(conn, id, to));
    }
    Ok(())
}

/// Processing → Sent.
pub fn mark_sent(conn: &Connection, id: Uuid, now: DateTime<Utc>) -> Result<(), NotifyError> {
    transition(
        conn,
        id,
        NotificationStatus::Sent,
        "sent_at = ?2, updated_at = ?2, error_message = NULL",
        params![id.to_string(), format_timestamp(now)],
    )
}

/// Processing | Sent → Delivered.
pub fn mark_delivered(conn: &Connection, id: Uuid, now: DateTime<Utc>) -> Result<(), NotifyError> {
    transition(
        conn,
        id,
        NotificationStatus::Delivered,
        "sent_at = COALESCE(sent_at, ?2), delivered_at = ?2, updated_at = ?2, \
         error_message = NULL",
        params![id.to_string(), format_timestamp(now)],
    )
}

/// Processing → Failed, counting the attempt.
pub fn mark_failed(
    conn: &Connection,
    id: Uuid,
    error: &str,
    now: DateTime<Utc>,
) -> Result<(), NotifyError> {
    transition(
        conn,
        id,
        NotificationStatus::Failed,
        "retry_count = retry_count + 1, error_message = ?3, updated_at = ?2",
        params![
            id.to_string(),
            format_timestamp(now),
            truncate_error(error, MAX_ERROR_LENGTH)
        ],
    )
}

/// Pending | Processing | Failed → Cancelled.
pub fn cancel(conn: &Connection, id: Uuid, now: DateTime<Utc>) -> Result<(), NotifyError> {
    transition(
        conn,
        id,
        NotificationStatus::Cancelled,
        "updated_at = ?2",
        params![id.to_string(), format_timestamp(now)],
    )
}

/// Failed → Pending, only if the row is still at `expected_version`.
///
/// Returns `false` when someone else changed the row first.
pub fn rearm(
    conn: &Connection,
    id: Uuid,
    expected_version: i64,
    now: DateTime<Utc>,
) -> Result<bool, NotifyError> {
    let sql = format!(
        "UPDATE notifications
         SET status = 'Pending', updated_at = ?2, version = version + 1
         WHERE id = ?1 AND version = ?3 AND status IN ({})",
        sources_of(NotificationStatus::Pending)
    );
    let updated = conn.execute(
        &sql,
        params![id.to_string(), format_timestamp(now), expected_version],
    )?;
    Ok(updated == 1)
}

/// Processing rows whose claim is older than `cutoff` become Failed so the
/// retry loop can pick them up again.
pub fn expire_stale_claims(
    conn: &Connection,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<usize, NotifyError> {
    Ok(conn.execute(
        "UPDATE notifications
         SET status = 'Failed', retry_count = retry_count + 1, error_message = ?3,
             updated_at = ?2, version = version + 1
         WHERE status = 'Processing' AND updated_at < ?1",
        params![
            format_timestamp(cutoff),
            format_timestamp(now),
            CLAIM_EXPIRED_ERROR
        ],
    )?)
}

/// From this many failures on, `created_at + 2^retry_count` minutes lies past
/// the largest representable timestamp, so the row is never due again.
pub const NEVER_DUE_RETRY_COUNT: u32 = 40;

/// Failed rows whose backoff has elapsed at `now`, longest overdue first.
///
/// Due time is `created_at + 2^retry_count` minutes, evaluated in SQL so rows
/// that are not due yet never take up the `limit`.
pub fn list_retry_due(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<Notification>, NotifyError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM notifications
         WHERE status = 'Failed'
           AND retry_count < ?3
           AND julianday(created_at) + (1 << retry_count) / 1440.0 <= julianday(?1)
         ORDER BY julianday(created_at) + (1 << retry_count) / 1440.0 ASC, rowid ASC
         LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![
                format_timestamp(now),
                i64::try_from(limit).unwrap_or(i64::MAX),
                NEVER_DUE_RETRY_COUNT
            ],
            notification_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Counts per status, optionally limited to rows whose last transition is
/// at or after `since`.
pub fn status_counts(
    conn: &Connection,
    since: Option<DateTime<Utc>>,
) -> Result<StatusCounts, NotifyError> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM notifications
         WHERE ?1 IS NULL OR updated_at >= ?1
         GROUP BY status",
    )?;
    let rows = stmt.query_map([since.map(format_timestamp)], |row| {
        Ok((
            parse_column::<NotificationStatus>(row, 0)?,
            row.get::<_, i64>(1)?,
        ))
    })?;

    let mut counts = StatusCounts::default();
    for row in rows {
        let (status, count) = row?;
        *counts.slot(status) = u64::try_from(count).unwrap_or(0);
    }
    Ok(counts)
}

/// Deletes finished rows (Sent, Delivered, Cancelled) whose last transition
/// is older than `cutoff`, in batches of `batch_size`.
pub fn delete_finished_before(
    conn: &Connection,
    cutoff: DateTime<Utc>,
    batch_size: usize,
) -> Result<usize, NotifyError> {
    let finished = NotificationStatus::ALL
        .iter()
        .filter(|s| s.is_finished())
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "DELETE FROM notifications WHERE id IN (
            SELECT id FROM notifications
            WHERE status IN ({finished}) AND updated_at < ?1
            LIMIT ?2
         )"
    );

    let cutoff = format_timestamp(cutoff);
    let limit = i64::try_from(batch_size.max(1)).unwrap_or(i64::MAX);
    let mut total = 0;
    loop {
        let deleted = conn.execute(&sql, params![cutoff, limit])?;
        total += deleted;
        if (deleted as i64) < limit {
            break;
        }
    }
    Ok(total)
}
