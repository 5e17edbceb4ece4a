//! Scholar event relay library logic.
//!
//! [`start`] wires the pipeline together and spawns one supervised task per
//! component:
//!
//! | Task | Does |
//! |------|------|
//! | `outbox-processor` | publishes pending outbox rows |
//! | `event-consumer` | routes broker messages to [`handlers`] (broker mode only) |
//! | `notification-dispatcher` | sends queued notifications |
//! | `notification-retry` | re-arms failed notifications on backoff |
//! | `retention-cleanup` | deletes finished rows past retention |
//! | `pipeline-metrics` | snapshots counts for logs and `/metrics` |

pub mod api;
pub mod background;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod retention;
pub mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use scholar_bus::{BrokerPublisher, Consumer, HttpPublisher, InMemoryBroker, Publisher};
use scholar_db::DbPool;
use scholar_notify::{Dispatcher, NotificationQueue, NotificationSender};
use scholar_outbox::{EventRegistry, OutboxProcessor};

use crate::api::AppState;
use crate::config::{Config, PublisherMode};
use crate::metrics::MetricsHandle;
use crate::supervisor::Supervisor;

pub use crate::error::{StartupError, TaskError};

/// A started relay.
pub struct Relay {
    pub supervisor: Supervisor,
    /// State for [`api::app`].
    pub state: AppState,
    pub queue: NotificationQueue,
    /// The in-process broker, when `broker.mode = "broker"`.
    pub broker: Option<InMemoryBroker>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("tasks", &self.supervisor.len())
            .field("queue", &self.queue)
            .field("broker", &self.broker.is_some())
            .finish()
    }
}

/// Builds the pipeline and spawns its tasks.
///
/// `pool` must already be migrated. Notifications are delivered through
/// `sender`.
///
/// # Errors
///
/// Returns `StartupError` if the configured publisher cannot be built.
pub fn start(
    config: &Config,
    pool: DbPool,
    sender: Arc<dyn NotificationSender>,
) -> Result<Relay, StartupError> {
    let queue = NotificationQueue::new(pool.clone(), config.notifications.poll_interval());
    let metrics_handle: MetricsHandle = metrics::new_handle();

    let (publisher, broker): (Arc<dyn Publisher>, Option<InMemoryBroker>) =
        match config.broker.mode {
            PublisherMode::Broker => {
                let broker = InMemoryBroker::new();
                broker.create_topic(&config.broker.topic);
                let publisher = BrokerPublisher::new(broker.clone(), config.broker.topic.clone());
                (Arc::new(publisher), Some(broker))
            }
            PublisherMode::Http => {
                let endpoint = config
                    .broker
                    .endpoint
                    .clone()
                    .ok_or(StartupError::MissingEndpoint)?;
                let publisher = HttpPublisher::new(
                    endpoint,
                    Duration::from_millis(config.broker.publish_timeout_ms),
                )?;
                (Arc::new(publisher), None)
            }
        };

    let mut supervisor = Supervisor::new();

    let processor = OutboxProcessor::new(
        pool.clone(),
        publisher,
        Arc::new(EventRegistry::school_events()),
        config.outbox.processor_config(),
    );
    supervisor.spawn("outbox-processor", move |token| processor.run(token));

    match &broker {
        Some(broker) => {
            let receiver =
                broker.create_subscription(&config.broker.topic, &config.broker.subscription);
            let router = Arc::new(handlers::school_router(queue.clone()));
            tracing::info!(
                topic = %config.broker.topic,
                subscription = %config.broker.subscription,
                event_types = ?router.event_types(),
                "event consumer subscribed"
            );
            let consumer = Consumer::new(receiver, router, config.consumer.consumer_config());
            supervisor.spawn("event-consumer", move |token| consumer.run(token));
        }
        None => tracing::info!(
            endpoint = config.broker.endpoint.as_deref().unwrap_or(""),
            "publishing over http, event consumer runs elsewhere"
        ),
    }

    let dispatcher = Dispatcher::new(
        queue.clone(),
        sender,
        config.notifications.dispatcher_config(),
    );
    supervisor.spawn("notification-dispatcher", move |token| dispatcher.run(token));

    let retry_queue = queue.clone();
    let retry_settings = config.notifications.clone();
    supervisor.spawn("notification-retry", move |token| {
        background::run_retry_loop(retry_queue, retry_settings, token)
    });

    let cleanup_pool = pool.clone();
    let cleanup_settings = config.cleanup.clone();
    supervisor.spawn("retention-cleanup", move |token| {
        retention::run_cleanup_loop(cleanup_pool, cleanup_settings, token)
    });

    let metrics_pool = pool.clone();
    let metrics_settings = config.metrics.clone();
    let max_retries = config.outbox.max_retries;
    let handle = metrics_handle.clone();
    supervisor.spawn("pipeline-metrics", move |token| {
        metrics::run_metrics_loop(metrics_pool, metrics_settings, max_retries, handle, token)
    });

    tracing::info!(tasks = supervisor.len(), "relay pipeline started");

    Ok(Relay {
        supervisor,
        state: AppState {
            pool,
            metrics: metrics_handle,
        },
        queue,
        broker,
    })
}
