//! Periodic pipeline metrics.
//!
//! A snapshot combines the outbox backlog and its outcomes over the last
//! hour with notification counts per status. The latest snapshot is kept in
//! a [`MetricsHandle`] and served by `/metrics`.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use scholar_db::{run_blocking, DbPool};
use scholar_notify::StatusCounts;
use scholar_outbox::OutboxStats;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::MetricsConfig;
use crate::error::TaskError;

/// Hours the "recent" counts cover.
const WINDOW_HOURS: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub outbox: OutboxStats,
    /// Notifications by status, counting rows that changed in the window.
    pub notifications_last_hour: StatusCounts,
    /// Notifications waiting to be sent right now (Pending plus Processing).
    pub notification_backlog: u64,
    /// Threshold breaches found in this snapshot.
    pub warnings: Vec<String>,
}

/// Shared latest snapshot. `None` until the first collection.
///
/// A std lock is fine here: it is only held to clone or replace the value.
pub type MetricsHandle = Arc<RwLock<Option<MetricsSnapshot>>>;

pub fn new_handle() -> MetricsHandle {
    Arc::new(RwLock::new(None))
}

pub fn latest(handle: &MetricsHandle) -> Option<MetricsSnapshot> {
    handle
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn store(handle: &MetricsHandle, snapshot: MetricsSnapshot) {
    *handle
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(snapshot);
}

fn threshold_warnings(
    settings: &MetricsConfig,
    outbox: &OutboxStats,
    recent: &StatusCounts,
) -> Vec<String> {
    let mut warnings = Vec::new();
    let threshold = settings.pending_warning_threshold;
    if threshold > 0 && outbox.pending >= threshold {
        warnings.push(format!(
            "outbox backlog {} reached threshold {threshold}",
            outbox.pending
        ));
    }
    let threshold = settings.failure_warning_threshold;
    let failures = outbox.failed + recent.failed;
    if threshold > 0 && failures >= threshold {
        warnings.push(format!(
            "{failures} failures in the last hour reached threshold {threshold}"
        ));
    }
    warnings
}

/// Collects a snapshot as of `now`.
pub async fn collect_snapshot(
    pool: &DbPool,
    settings: &MetricsConfig,
    max_retries: u32,
    now: DateTime<Utc>,
) -> Result<MetricsSnapshot, TaskError> {
    let since = now - chrono::Duration::hours(WINDOW_HOURS);
    let (outbox, recent, current) = run_blocking(pool, move |conn| {
        let outbox = scholar_outbox::outbox_stats(conn, since, max_retries)?;
        let recent = scholar_notify::status_counts(conn, Some(since))?;
        let current = scholar_notify::status_counts(conn, None)?;
        Ok::<_, TaskError>((outbox, recent, current))
    })
    .await?;

    let warnings = threshold_warnings(settings, &outbox, &recent);
    Ok(MetricsSnapshot {
        taken_at: now,
        outbox,
        notifications_last_hour: recent,
        notification_backlog: current.pending + current.processing,
        warnings,
    })
}

fn log_snapshot(snapshot: &MetricsSnapshot) {
    let recent = &snapshot.notifications_last_hour;
    tracing::info!(
        outbox_pending = snapshot.outbox.pending,
        outbox_retrying = snapshot.outbox.retrying,
        outbox_processed = snapshot.outbox.processed,
        outbox_failed = snapshot.outbox.failed,
        notifications_sent = recent.sent,
        notifications_delivered = recent.delivered,
        notifications_failed = recent.failed,
        notifications_cancelled = recent.cancelled,
        notification_backlog = snapshot.notification_backlog,
        "pipeline metrics"
    );
    for warning in &snapshot.warnings {
        tracing::warn!(warning = %warning, "pipeline metrics threshold crossed");
    }
}

/// Starts the metrics loop. Collects immediately, then every interval.
pub async fn run_metrics_loop(
    pool: DbPool,
    settings: MetricsConfig,
    max_retries: u32,
    handle: MetricsHandle,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(settings.interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!(
        interval_secs = settings.interval_secs,
        "starting pipeline metrics task"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match collect_snapshot(&pool, &settings, max_retries, Utc::now()).await {
            Ok(snapshot) => {
                log_snapshot(&snapshot);
                store(&handle, snapshot);
            }
            Err(e) => tracing::error!(error = %e, "failed to collect pipeline metrics"),
        }
    }

    tracing::info!("pipeline metrics task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pending: u64, failures: u64) -> MetricsConfig {
        MetricsConfig {
            interval_secs: 60,
            pending_warning_threshold: pending,
            failure_warning_threshold: failures,
        }
    }

    #[test]
    fn no_warnings_below_thresholds() {
        let outbox = OutboxStats {
            pending: 9,
            failed: 1,
            ..OutboxStats::default()
        };
        let recent = StatusCounts {
            failed: 1,
            ..StatusCounts::default()
        };
        assert!(threshold_warnings(&settings(10, 3), &outbox, &recent).is_empty());
    }

    #[test]
    fn warnings_at_thresholds() {
        let outbox = OutboxStats {
            pending: 10,
            failed: 2,
            ..OutboxStats::default()
        };
        let recent = StatusCounts {
            failed: 1,
            ..StatusCounts::default()
        };
        let warnings = threshold_warnings(&settings(10, 3), &outbox, &recent);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("backlog 10"));
        assert!(warnings[1].contains("3 failures"));
    }

    #[test]
    fn zero_disables_a_threshold() {
        let outbox = OutboxStats {
            pending: 10_000,
            failed: 10_000,
            ..OutboxStats::default()
        };
        assert!(threshold_warnings(&settings(0, 0), &outbox, &StatusCounts::default()).is_empty());
    }

    #[test]
    fn handle_starts_empty_and_keeps_latest() {
        let handle = new_handle();
        assert!(latest(&handle).is_none());

        let snapshot = MetricsSnapshot {
            taken_at: Utc::now(),
            outbox: OutboxStats::default(),
            notifications_last_hour: StatusCounts::default(),
            notification_backlog: 4,
            warnings: Vec::new(),
        };
        store(&handle, snapshot.clone());
        assert_eq!(latest(&handle), Some(snapshot));
    }
}
