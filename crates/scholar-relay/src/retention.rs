//! Background task enforcing retention windows on finished rows.
//!
//! Only rows that can no longer change are removed: outbox rows with
//! `processed_at` set, and notifications that are Sent, Delivered or
//! Cancelled. Pending work is never touched.

use std::time::Duration;

use chrono::{DateTime, Utc};
use scholar_db::{run_blocking, DbPool};
use tokio_util::sync::CancellationToken;

use crate::config::CleanupConfig;
use crate::error::TaskError;

/// Rows removed by one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub outbox_deleted: usize,
    pub notifications_deleted: usize,
}

fn cutoff(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    chrono::Duration::try_days(days.max(0))
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Runs one cleanup pass relative to `now`.
pub async fn run_cleanup_once(
    pool: &DbPool,
    settings: &CleanupConfig,
    now: DateTime<Utc>,
) -> Result<CleanupReport, TaskError> {
    let outbox_cutoff = cutoff(now, settings.outbox_retention_days);
    let notification_cutoff = cutoff(now, settings.notification_retention_days);
    let batch_size = settings.batch_size;

    run_blocking(pool, move |conn| {
        let outbox_deleted =
            scholar_outbox::delete_processed_before(conn, outbox_cutoff, batch_size)?;
        let notifications_deleted =
            scholar_notify::delete_finished_before(conn, notification_cutoff, batch_size)?;
        Ok::<_, TaskError>(CleanupReport {
            outbox_deleted,
            notifications_deleted,
        })
    })
    .await
}

/// Starts the cleanup loop. Runs until `shutdown` fires.
///
/// Sleeps first so startup is not slowed by a large delete.
pub async fn run_cleanup_loop(pool: DbPool, settings: CleanupConfig, shutdown: CancellationToken) {
    let interval = Duration::from_secs(settings.interval_secs.max(1));
    tracing::info!(
        interval_secs = interval.as_secs(),
        outbox_retention_days = settings.outbox_retention_days,
        notification_retention_days = settings.notification_retention_days,
        "starting retention cleanup task"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match run_cleanup_once(&pool, &settings, Utc::now()).await {
            Ok(report) if report.outbox_deleted > 0 || report.notifications_deleted > 0 => {
                tracing::info!(
                    outbox_deleted = report.outbox_deleted,
                    notifications_deleted = report.notifications_deleted,
                    "deleted rows past retention"
                );
            }
            Ok(_) => tracing::debug!("no rows past retention"),
            // Retried on the next interval.
            Err(e) => tracing::error!(error = %e, "retention cleanup failed"),
        }
    }

    tracing::info!("retention cleanup task stopped");
}
