//! The outbox row and its in-memory state transitions.

use chrono::{DateTime, Utc};
use scholar_types::{truncate_error, MAX_ERROR_LENGTH};
use serde::Serialize;
use uuid::Uuid;

/// A serialised domain event waiting to be published.
///
/// The processor fetches rows, mutates them in memory through the methods
/// below, then writes every changed row back in one transaction guarded by
/// `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub event_type: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    /// Set once the row is finished, whether published or given up on.
    pub processed_at: Option<DateTime<Utc>>,
    /// `None` until the first failed publish.
    pub retry_count: Option<u32>,
    pub error: Option<String>,
    /// Optimistic concurrency counter, bumped on every write-back.
    pub version: i64,
}

/// Where a row stands after a failed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Still pending; `attempts` failures so far.
    Retrying { attempts: u32 },
    /// Reached the retry cap and was marked processed.
    Exhausted,
}

impl OutboxMessage {
    pub fn new(
        event_type: impl Into<String>,
        payload: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload: payload.into(),
            created_at,
            processed_at: None,
            retry_count: None,
            error: None,
            version: 0,
        }
    }

    pub fn is_pending(&self, max_retries: u32) -> bool {
        self.processed_at.is_none() && self.retry_count.map_or(true, |n| n < max_retries)
    }

    /// Failed publishes so far.
    pub fn attempts(&self) -> u32 {
        self.retry_count.unwrap_or(0)
    }

    /// Marks the row as published. A no-op on a finished row.
    pub fn mark_published(&mut self, now: DateTime<Utc>) -> bool {
        if self.processed_at.is_some() {
            return false;
        }
        self.processed_at = Some(now);
        self.error = None;
        true
    }

    /// Finishes the row without publishing it. A no-op on a finished row.
    pub fn mark_permanent_failure(
        &mut self,
        reason: &str,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> bool {
        if self.processed_at.is_some() {
            return false;
        }
        self.processed_at = Some(now);
        self.retry_count = Some(max_retries);
        self.error = Some(truncate_error(reason, MAX_ERROR_LENGTH));
        true
    }

    /// Counts a failed publish, finishing the row once the cap is reached.
    pub fn record_transient_failure(
        &mut self,
        error: &str,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> RetryState {
        let attempts = self.attempts().saturating_add(1);
        self.retry_count = Some(attempts);
        self.error = Some(truncate_error(error, MAX_ERROR_LENGTH));

        if attempts >= max_retries {
            self.processed_at = Some(now);
            RetryState::Exhausted
        } else {
            RetryState::Retrying { attempts }
        }
    }
}
