//! Delivery loop draining the notification queue.

use std::sync::Arc;
use std::time::Duration;

use scholar_types::NotificationStatus;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::NotifyError;
use crate::model::Notification;
use crate::queue::NotificationQueue;
use crate::sender::{DeliveryReceipt, NotificationSender};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Sends in flight at once.
    pub max_concurrent: usize,
    /// Pause after the queue itself errors.
    pub error_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            error_backoff: Duration::from_secs(5),
        }
    }
}

pub struct Dispatcher {
    queue: NotificationQueue,
    sender: Arc<dyn NotificationSender>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        queue: NotificationQueue,
        sender: Arc<dyn NotificationSender>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            queue,
            sender,
            config,
        }
    }

    /// Runs until `shutdown` fires, then waits for in-flight sends.
    pub async fn run(self, shutdown: CancellationToken) {
        let max_concurrent = self.config.max_concurrent.max(1);
        tracing::info!(max_concurrent, "notification dispatcher started");

        match self.queue.prime().await {
            Ok(ready) => tracing::debug!(ready, "notification queue primed"),
            Err(e) => tracing::warn!(error = %e, "failed to prime notification queue"),
        }

        let limiter = Arc::new(Semaphore::new(max_concurrent));
        let mut in_flight = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let notification = match self.queue.dequeue(&shutdown).await {
                Ok(Some(notification)) => notification,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "notification dequeue failed");
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                    continue;
                }
            };

            let queue = self.queue.clone();
            let sender = self.sender.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                let id = notification.id;
                if let Err(e) = deliver(&queue, sender.as_ref(), notification).await {
                    tracing::error!(
                        notification_id = %id,
                        error = %e,
                        "failed to record delivery outcome"
                    );
                }
            });

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "delivery task failed");
                }
            }
        }

        tracing::info!(
            in_flight = in_flight.len(),
            "notification dispatcher stopping, draining in-flight sends"
        );
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "delivery task failed");
            }
        }
        tracing::info!("notification dispatcher stopped");
    }
}

/// Sends one claimed notification and records the outcome.
///
/// Returns the status the row ended in.
pub async fn deliver(
    queue: &NotificationQueue,
    sender: &dyn NotificationSender,
    notification: Notification,
) -> Result<NotificationStatus, NotifyError> {
    match sender.send(&notification).await {
        Ok(DeliveryReceipt::Sent) => {
            queue.mark_sent(notification.id).await?;
            Ok(NotificationStatus::Sent)
        }
        Ok(DeliveryReceipt::Delivered) => {
            queue.mark_delivered(notification.id).await?;
            Ok(NotificationStatus::Delivered)
        }
        Err(e) => {
            tracing::warn!(
                notification_id = %notification.id,
                channel = %notification.channel,
                retry_count = notification.retry_count,
                error = %e,
                "notification delivery failed"
            );
            queue.mark_failed(notification.id, e.to_string()).await?;
            Ok(NotificationStatus::Failed)
        }
    }
}
