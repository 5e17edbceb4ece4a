//! Durable notification queue backed by the notifications table.
//!
//! A counting semaphore carries "work may be available" hints between
//! producers and dequeuers. The table stays the source of truth: a hint never
//! guarantees a claimable row, and rows that become due through
//! `scheduled_at` are found by the poll-interval fallback.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use scholar_db::{run_blocking, DbPool};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::NotifyError;
use crate::model::{NewNotification, Notification};
use crate::retry;
use crate::store::{self, StatusCounts};

/// Candidates inspected per claim attempt.
const CLAIM_SCAN: usize = 16;

/// Cheap to clone; clones share the signal.
#[derive(Clone)]
pub struct NotificationQueue {
    pool: DbPool,
    signal: Arc<Semaphore>,
    poll_interval: Duration,
}

impl std::fmt::Debug for NotificationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationQueue")
            .field("available_hints", &self.signal.available_permits())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

fn claim_up_to(
    conn: &Connection,
    max: usize,
    now: DateTime<Utc>,
) -> Result<Vec<Notification>, NotifyError> {
    let mut claimed = Vec::new();
    if max == 0 {
        return Ok(claimed);
    }
    for id in store::ready_candidates(conn, now, max.max(CLAIM_SCAN))? {
        match store::claim(conn, id, now) {
            Ok(Some(notification)) => {
                claimed.push(notification);
                if claimed.len() == max {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(notification_id = %id, error = %e, "claim failed, skipping");
            }
        }
    }
    Ok(claimed)
}

impl NotificationQueue {
    pub fn new(pool: DbPool, poll_interval: Duration) -> Self {
        Self {
            pool,
            signal: Arc::new(Semaphore::new(0)),
            poll_interval,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Inserts a Pending notification and wakes one dequeuer.
    pub async fn enqueue(&self, new: NewNotification) -> Result<Notification, NotifyError> {
        let notification =
            run_blocking(&self.pool, move |conn| store::insert(conn, &new, Utc::now())).await?;
        self.notify_available(1);
        Ok(notification)
    }

    /// Like [`enqueue`](Self::enqueue), but returns `None` without inserting
    /// when a notification with the same correlation id already exists.
    pub async fn enqueue_once(
        &self,
        new: NewNotification,
    ) -> Result<Option<Notification>, NotifyError> {
        let inserted =
            run_blocking(&self.pool, move |conn| store::insert_once(conn, &new, Utc::now()))
                .await?;
        if inserted.is_some() {
            self.notify_available(1);
        }
        Ok(inserted)
    }

    /// Records that `count` rows may have become claimable.
    pub fn notify_available(&self, count: usize) {
        let room = Semaphore::MAX_PERMITS.saturating_sub(self.signal.available_permits());
        let count = count.min(room);
        if count > 0 {
            self.signal.add_permits(count);
        }
    }

    /// Seeds the signal with the rows already due, e.g. after a restart.
    pub async fn prime(&self) -> Result<u64, NotifyError> {
        let ready = run_blocking(&self.pool, |conn| store::count_ready(conn, Utc::now())).await?;
        self.notify_available(usize::try_from(ready).unwrap_or(usize::MAX));
        Ok(ready)
    }

    /// Claims the next ready notification, waiting for one if none is ready.
    ///
    /// Returns `Ok(None)` once `cancel` fires.
    pub async fn dequeue(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Notification>, NotifyError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(notification) = self.claim(1).await?.into_iter().next() {
                if let Ok(permit) = self.signal.try_acquire() {
                    permit.forget();
                }
                return Ok(Some(notification));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                permit = self.signal.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Claims up to `max` ready notifications without waiting.
    pub async fn dequeue_batch(&self, max: usize) -> Result<Vec<Notification>, NotifyError> {
        self.claim(max).await
    }

    async fn claim(&self, max: usize) -> Result<Vec<Notification>, NotifyError> {
        run_blocking(&self.pool, move |conn| claim_up_to(conn, max, Utc::now())).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Notification, NotifyError> {
        run_blocking(&self.pool, move |conn| store::get(conn, id)).await
    }

    pub async fn mark_sent(&self, id: Uuid) -> Result<(), NotifyError> {
        run_blocking(&self.pool, move |conn| store::mark_sent(conn, id, Utc::now())).await
    }

    pub async fn mark_delivered(&self, id: Uuid) -> Result<(), NotifyError> {
        run_blocking(&self.pool, move |conn| {
            store::mark_delivered(conn, id, Utc::now())
        })
        .await
    }

    pub async fn mark_failed(&self, id: Uuid, error: String) -> Result<(), NotifyError> {
        run_blocking(&self.pool, move |conn| {
            store::mark_failed(conn, id, &error, Utc::now())
        })
        .await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<(), NotifyError> {
        run_blocking(&self.pool, move |conn| store::cancel(conn, id, Utc::now())).await
    }

    /// Re-arms eligible Failed rows and wakes a dequeuer per row.
    pub async fn retry_failed(&self, now: DateTime<Utc>, limit: usize) -> Result<usize, NotifyError> {
        let rearmed =
            run_blocking(&self.pool, move |conn| retry::rearm_eligible(conn, now, limit)).await?;
        self.notify_available(rearmed);
        Ok(rearmed)
    }

    /// Fails Processing rows claimed before `cutoff`.
    pub async fn expire_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<usize, NotifyError> {
        run_blocking(&self.pool, move |conn| {
            store::expire_stale_claims(conn, cutoff, Utc::now())
        })
        .await
    }

    pub async fn status_counts(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<StatusCounts, NotifyError> {
        run_blocking(&self.pool, move |conn| store::status_counts(conn, since)).await
    }
}
