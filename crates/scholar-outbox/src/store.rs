//! Persistence operations for the outbox table.
//!
//! Writes from the application side go through [`enqueue`], which takes any
//! `&Connection`. Pass a `rusqlite::Transaction` (it derefs to `Connection`)
//! to commit the outbox row atomically with the business change.
//!
//! The processor reads with [`fetch_pending`] and writes back with
//! [`save_batch`], which applies every change in one transaction and rolls
//! back if any row's `version` moved underneath it.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use scholar_db::{format_timestamp, optional_timestamp_column, timestamp_column};
use scholar_types::DomainEvent;
use serde::Serialize;
use uuid::Uuid;

use crate::error::OutboxError;
use crate::message::OutboxMessage;

const COLUMNS: &str =
    "id, event_type, payload, created_at, processed_at, retry_count, error, version";

/// Result of writing a processed batch back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Every row was written.
    Saved { rows: usize },
    /// A row was changed by someone else; nothing was written.
    Conflict { id: Uuid },
}

/// Outbox counts reported by the metrics loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    /// Current backlog, including rows being retried.
    pub pending: u64,
    /// Current backlog rows with at least one failed publish.
    pub retrying: u64,
    /// Rows published since the window start.
    pub processed: u64,
    /// Rows given up on since the window start.
    pub failed: u64,
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxMessage> {
    let raw_id: String = row.get(0)?;
    let id = Uuid::parse_str(&raw_id)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let retry_count: Option<i64> = row.get(5)?;

    Ok(OutboxMessage {
        id,
        event_type: row.get(1)?,
        payload: row.get(2)?,
        created_at: timestamp_column(row, 3)?,
        processed_at: optional_timestamp_column(row, 4)?,
        retry_count: retry_count.map(|n| u32::try_from(n.max(0)).unwrap_or(u32::MAX)),
        error: row.get(6)?,
        version: row.get(7)?,
    })
}

/// Serialises `event` and inserts it as a pending row.
///
/// # Errors
///
/// Returns `OutboxError::Serialization` if the event cannot be encoded or
/// `OutboxError::Database` if the insert fails.
pub fn enqueue<E: DomainEvent>(conn: &Connection, event: &E) -> Result<OutboxMessage, OutboxError> {
    let payload = serde_json::to_string(event)?;
    enqueue_raw(conn, E::EVENT_TYPE, &payload, Utc::now())
}

/// Inserts a pending row with an already-serialised payload.
pub fn enqueue_raw(
    conn: &Connection,
    event_type: &str,
    payload: &str,
    created_at: DateTime<Utc>,
) -> Result<OutboxMessage, OutboxError> {
    let message = OutboxMessage::new(event_type, payload, created_at);
    conn.execute(
        "INSERT INTO outbox_messages (id, event_type, payload, created_at, version)
         VALUES (?1, ?2, ?3, ?4, 0)",
        params![
            message.id.to_string(),
            message.event_type,
            message.payload,
            format_timestamp(message.created_at),
        ],
    )?;

    tracing::debug!(
        message_id = %message.id,
        event_type = %message.event_type,
        "outbox message enqueued"
    );
    Ok(message)
}

/// Loads one row by id.
pub fn get(conn: &Connection, id: Uuid) -> Result<Option<OutboxMessage>, OutboxError> {
    let sql = format!("SELECT {COLUMNS} FROM outbox_messages WHERE id = ?1");
    Ok(conn
        .query_row(&sql, [id.to_string()], message_from_row)
        .optional()?)
}

/// Returns up to `batch_size` pending rows, oldest first.
pub fn fetch_pending(
    conn: &Connection,
    batch_size: usize,
    max_retries: u32,
) -> Result<Vec<OutboxMessage>, OutboxError> {
    let sql = format!(
        "SELECT {COLUMNS} FROM outbox_messages
         WHERE processed_at IS NULL
           AND (retry_count IS NULL OR retry_count < ?1)
         ORDER BY created_at ASC, rowid ASC
         LIMIT ?2"
    );
    let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![max_retries, limit], message_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Writes every changed row back in one transaction.
///
/// Each update is conditional on the row's `version` and on it still being
/// unprocessed. The first row that fails the condition rolls the whole batch
/// back and is reported as a conflict.
pub fn save_batch(
    conn: &mut Connection,
    messages: &[OutboxMessage],
) -> Result<SaveOutcome, OutboxError> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "UPDATE outbox_messages
             SET processed_at = ?1, retry_count = ?2, error = ?3, version = version + 1
             WHERE id = ?4 AND version = ?5 AND processed_at IS NULL",
        )?;
        for message in messages {
            let updated = stmt.execute(params![
                message.processed_at.map(format_timestamp),
                message.retry_count,
                message.error,
                message.id.to_string(),
                message.version,
            ])?;
            if updated == 0 {
                return Ok(SaveOutcome::Conflict { id: message.id });
            }
        }
    }
    tx.commit()?;
    Ok(SaveOutcome::Saved {
        rows: messages.len(),
    })
}

/// Number of rows still eligible for publishing.
pub fn count_pending(conn: &Connection, max_retries: u32) -> Result<u64, OutboxError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM outbox_messages
         WHERE processed_at IS NULL AND (retry_count IS NULL OR retry_count < ?1)",
        [max_retries],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or(0))
}

/// Deletes processed rows older than `cutoff` in batches of `batch_size`.
///
/// Pending rows are never touched. Returns the number of rows deleted.
pub fn delete_processed_before(
    conn: &Connection,
    cutoff: DateTime<Utc>,
    batch_size: usize,
) -> Result<usize, OutboxError> {
    let cutoff = format_timestamp(cutoff);
    let limit = i64::try_from(batch_size.max(1)).unwrap_or(i64::MAX);
    let mut total = 0;
    loop {
        let deleted = conn.execute(
            "DELETE FROM outbox_messages WHERE id IN (
                SELECT id FROM outbox_messages
                WHERE processed_at IS NOT NULL AND processed_at < ?1
                LIMIT ?2
             )",
            params![cutoff, limit],
        )?;
        total += deleted;
        if (deleted as i64) < limit {
            break;
        }
    }
    Ok(total)
}

/// Backlog counts now, plus outcomes since `since`.
pub fn outbox_stats(
    conn: &Connection,
    since: DateTime<Utc>,
    max_retries: u32,
) -> Result<OutboxStats, OutboxError> {
    let (pending, retrying, processed, failed): (i64, i64, i64, i64) = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN processed_at IS NULL
                              AND (retry_count IS NULL OR retry_count < ?2) THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN processed_at IS NULL
                              AND retry_count > 0 AND retry_count < ?2 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN processed_at >= ?1 AND error IS NULL THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN processed_at >= ?1 AND error IS NOT NULL THEN 1 ELSE 0 END), 0)
         FROM outbox_messages",
        params![format_timestamp(since), max_retries],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;

    let to_u64 = |n: i64| u64::try_from(n).unwrap_or(0);
    Ok(OutboxStats {
        pending: to_u64(pending),
        retrying: to_u64(retrying),
        processed: to_u64(processed),
        failed: to_u64(failed),
    })
}
