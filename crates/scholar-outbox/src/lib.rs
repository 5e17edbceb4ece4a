//! Transactional outbox for the Scholar event relay.
//!
//! The school write path inserts an outbox row in the same transaction as the
//! business change ([`enqueue`]). The [`OutboxProcessor`] later drains pending
//! rows, validates each payload against the [`EventRegistry`], publishes it,
//! and records the outcome on the row.
//!
//! # Row lifecycle
//!
//! | State | `processed_at` | `retry_count` | `error` |
//! |-------|----------------|---------------|---------|
//! | pending | null | null or `< max_retries` | last failure, if any |
//! | published | set | unchanged | null |
//! | rejected (bad payload, unknown tag) | set | `max_retries` | reason |
//! | exhausted (publish kept failing) | set | `max_retries` | last failure |
//!
//! Finished rows are immutable and are removed by the cleanup loop after the
//! retention window.
//!
//! # Usage
//!
//! ```rust,ignore
//! use scholar_outbox::enqueue;
//! use scholar_types::StudentEnrolledEvent;
//!
//! let tx = conn.transaction()?;
//! tx.execute("INSERT INTO enrollments ...", params![...])?;
//! enqueue(&tx, &StudentEnrolledEvent { .. })?;
//! tx.commit()?;
//! ```

mod error;
mod execution;
mod message;
mod processor;
mod registry;
mod store;

pub use error::{DecodeError, OutboxError};
pub use execution::ExecutionStrategy;
pub use message::{OutboxMessage, RetryState};
pub use processor::{CycleReport, OutboxProcessor, ProcessorConfig};
pub use registry::EventRegistry;
pub use store::{
    count_pending, delete_processed_before, enqueue, enqueue_raw, fetch_pending, get,
    outbox_stats, save_batch, OutboxStats, SaveOutcome,
};
