//! The outbox poll loop.
//!
//! Each cycle fetches a batch of pending rows, validates and publishes them in
//! `created_at` order, and writes every changed row back in one transaction.
//! A crash or conflict between publish and write-back leaves the row pending,
//! so it is published again on a later cycle: delivery is at-least-once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{stream, StreamExt};
use scholar_bus::{Envelope, PublishError, Publisher};
use scholar_db::{run_blocking, DbPool};
use tokio_util::sync::CancellationToken;

use crate::error::OutboxError;
use crate::execution::ExecutionStrategy;
use crate::message::{OutboxMessage, RetryState};
use crate::registry::EventRegistry;
use crate::store::{self, SaveOutcome};

/// Tunables for [`OutboxProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Sleep between polls when the last batch did not fill up.
    pub processing_interval: Duration,
    pub batch_size: usize,
    /// Failed publishes after which a row is given up on.
    pub max_retries: u32,
    /// Publishes in flight at once within a batch. Results keep batch order.
    pub publish_concurrency: usize,
    /// Sleep after a cycle whose database work failed outright.
    pub error_cooldown: Duration,
    pub execution: ExecutionStrategy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            processing_interval: Duration::from_secs(5),
            batch_size: 50,
            max_retries: 5,
            publish_concurrency: 1,
            error_cooldown: Duration::from_secs(30),
            execution: ExecutionStrategy::default(),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub published: usize,
    /// Rows that failed to publish and stay pending.
    pub retrying: usize,
    /// Rows that hit the retry cap on this cycle.
    pub exhausted: usize,
    /// Rows that can never be published (bad payload or unknown tag).
    pub rejected: usize,
    /// Rows left untouched because shutdown began.
    pub skipped: usize,
    /// The write-back hit a version conflict and was rolled back.
    pub conflict: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Published,
    Retrying,
    Exhausted,
    Rejected,
    Skipped,
}

pub struct OutboxProcessor {
    pool: DbPool,
    publisher: Arc<dyn Publisher>,
    registry: Arc<EventRegistry>,
    config: ProcessorConfig,
}

impl OutboxProcessor {
    pub fn new(
        pool: DbPool,
        publisher: Arc<dyn Publisher>,
        registry: Arc<EventRegistry>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            pool,
            publisher,
            registry,
            config,
        }
    }

    /// Polls until `shutdown` fires, then logs the remaining backlog.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            interval_ms = self.config.processing_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "outbox processor started"
        );

        while !shutdown.is_cancelled() {
            let wait = match self.run_cycle(&shutdown).await {
                Ok(report) if report.fetched == 0 => self.config.processing_interval,
                Ok(report) => {
                    tracing::info!(
                        fetched = report.fetched,
                        published = report.published,
                        retrying = report.retrying,
                        exhausted = report.exhausted,
                        rejected = report.rejected,
                        conflict = report.conflict,
                        "outbox batch processed"
                    );
                    if self.should_continue_immediately(&report) {
                        Duration::ZERO
                    } else {
                        self.config.processing_interval
                    }
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        cooldown_secs = self.config.error_cooldown.as_secs(),
                        "outbox cycle failed, cooling down"
                    );
                    self.config.error_cooldown
                }
            };

            if wait.is_zero() {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let max_retries = self.config.max_retries;
        match run_blocking(&self.pool, move |conn| {
            store::count_pending(conn, max_retries)
        })
        .await
        {
            Ok(pending) => tracing::info!(pending, "outbox processor stopped"),
            Err(e) => tracing::warn!(error = %e, "outbox processor stopped; pending count unavailable"),
        }
    }

    /// A full batch that made clean progress suggests more work is waiting.
    fn should_continue_immediately(&self, report: &CycleReport) -> bool {
        report.fetched >= self.config.batch_size
            && report.retrying == 0
            && report.skipped == 0
            && !report.conflict
    }

    /// Runs one fetch → publish → write-back cycle.
    ///
    /// # Errors
    ///
    /// Only database failures surface here; per-row publish and decode
    /// failures are recorded on the rows themselves.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> Result<CycleReport, OutboxError> {
        let batch = self.fetch_batch(shutdown).await?;
        let mut report = CycleReport {
            fetched: batch.len(),
            ..CycleReport::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        let outcomes = self.process_batch(batch, shutdown).await;
        let mut modified = Vec::with_capacity(outcomes.len());
        for (message, outcome) in outcomes {
            match outcome {
                Outcome::Published => report.published += 1,
                Outcome::Retrying => report.retrying += 1,
                Outcome::Exhausted => report.exhausted += 1,
                Outcome::Rejected => report.rejected += 1,
                Outcome::Skipped => {
                    report.skipped += 1;
                    continue;
                }
            }
            modified.push(message);
        }

        if modified.is_empty() {
            return Ok(report);
        }

        match self.persist(modified).await? {
            SaveOutcome::Saved { rows } => {
                tracing::debug!(rows, "outbox batch saved");
            }
            SaveOutcome::Conflict { id } => {
                tracing::warn!(
                    message_id = %id,
                    "outbox row changed concurrently, batch rolled back"
                );
                report.conflict = true;
            }
        }
        Ok(report)
    }

    async fn fetch_batch(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        let batch_size = self.config.batch_size;
        let max_retries = self.config.max_retries;
        self.config
            .execution
            .execute("fetch_pending", shutdown, || {
                let pool = self.pool.clone();
                async move {
                    run_blocking(&pool, move |conn| {
                        store::fetch_pending(conn, batch_size, max_retries)
                    })
                    .await
                }
            })
            .await
    }

    async fn process_batch(
        &self,
        batch: Vec<OutboxMessage>,
        shutdown: &CancellationToken,
    ) -> Vec<(OutboxMessage, Outcome)> {
        stream::iter(batch)
            .map(|message| self.process_one(message, shutdown))
            .buffered(self.config.publish_concurrency.max(1))
            .collect()
            .await
    }

    async fn process_one(
        &self,
        mut message: OutboxMessage,
        shutdown: &CancellationToken,
    ) -> (OutboxMessage, Outcome) {
        if shutdown.is_cancelled() {
            return (message, Outcome::Skipped);
        }
        let max_retries = self.config.max_retries;

        if let Err(e) = self.registry.validate(&message.event_type, &message.payload) {
            tracing::warn!(
                message_id = %message.id,
                event_type = %message.event_type,
                error = %e,
                "outbox message cannot be published, marking processed"
            );
            message.mark_permanent_failure(&e.to_string(), max_retries, Utc::now());
            return (message, Outcome::Rejected);
        }

        let envelope = Envelope::new(
            message.id.to_string(),
            message.event_type.clone(),
            message.payload.clone(),
            Utc::now(),
        );
        match self.publisher.publish(&envelope, shutdown).await {
            Ok(()) => {
                message.mark_published(Utc::now());
                (message, Outcome::Published)
            }
            Err(PublishError::Cancelled) => (message, Outcome::Skipped),
            Err(e) => {
                let reason = e.to_string();
                match message.record_transient_failure(&reason, max_retries, Utc::now()) {
                    RetryState::Retrying { attempts } => {
                        tracing::warn!(
                            message_id = %message.id,
                            event_type = %message.event_type,
                            attempts,
                            max_retries,
                            error = %reason,
                            "outbox publish failed, will retry"
                        );
                        (message, Outcome::Retrying)
                    }
                    RetryState::Exhausted => {
                        tracing::error!(
                            message_id = %message.id,
                            event_type = %message.event_type,
                            attempts = max_retries,
                            error = %reason,
                            "outbox message exhausted retries; manual follow-up required"
                        );
                        (message, Outcome::Exhausted)
                    }
                }
            }
        }
    }

    async fn persist(&self, modified: Vec<OutboxMessage>) -> Result<SaveOutcome, OutboxError> {
        run_blocking(&self.pool, move |conn| store::save_batch(conn, &modified)).await
    }
}
