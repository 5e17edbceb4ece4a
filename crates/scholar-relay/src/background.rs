//! Notification retry loop.
//!
//! Each pass fails Processing rows whose claim outlived the claim timeout,
//! then re-arms Failed rows whose backoff has elapsed.

use std::time::Duration;

use chrono::Utc;
use scholar_notify::{NotificationQueue, NotifyError};
use tokio_util::sync::CancellationToken;

use crate::config::NotificationsConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPass {
    pub expired: usize,
    pub rearmed: usize,
}

/// Runs one retry pass.
pub async fn run_retry_once(
    queue: &NotificationQueue,
    claim_timeout: Duration,
    batch_size: usize,
) -> Result<RetryPass, NotifyError> {
    let now = Utc::now();
    let claim_timeout =
        chrono::Duration::from_std(claim_timeout).unwrap_or(chrono::Duration::MAX);
    let cutoff = now
        .checked_sub_signed(claim_timeout)
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

    let expired = queue.expire_stale_claims(cutoff).await?;
    let rearmed = queue.retry_failed(now, batch_size).await?;
    Ok(RetryPass { expired, rearmed })
}

/// Starts the notification retry loop. Runs until `shutdown` fires.
pub async fn run_retry_loop(
    queue: NotificationQueue,
    settings: NotificationsConfig,
    shutdown: CancellationToken,
) {
    let interval = Duration::from_secs(settings.retry_interval_secs.max(1));
    let claim_timeout = Duration::from_secs(settings.claim_timeout_secs);
    tracing::info!(
        interval_secs = interval.as_secs(),
        claim_timeout_secs = settings.claim_timeout_secs,
        "starting notification retry task"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match run_retry_once(&queue, claim_timeout, settings.retry_batch_size).await {
            Ok(pass) if pass.expired > 0 || pass.rearmed > 0 => {
                tracing::info!(
                    expired = pass.expired,
                    rearmed = pass.rearmed,
                    "notification retry pass"
                );
            }
            Ok(_) => tracing::debug!("no notifications due for retry"),
            Err(e) => tracing::error!(error = %e, "notification retry pass failed"),
        }
    }

    tracing::info!("notification retry task stopped");
}
