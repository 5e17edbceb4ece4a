//! Database layer for the Scholar event relay.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! embedded SQL migrations for the outbox and notification tables, the
//! timestamp encoding every table shares, and a bridge that runs blocking
//! database work from async tasks.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: the relay shares one database file with the
//!   application that writes business rows and outbox rows in the same
//!   transaction. WAL lets the pollers read while that writer commits.
//! - **Conditional updates for claims**: every status transition is a single
//!   `UPDATE ... WHERE <expected state>` statement, so SQLite's writer lock is
//!   the only coordination between concurrent pollers.
//! - **Fixed-width timestamps**: see [`format_timestamp`].

mod blocking;
mod migrations;
mod pool;
mod time;

pub use blocking::{run_blocking, DbError};
pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
pub use time::{format_timestamp, optional_timestamp_column, parse_timestamp, timestamp_column};
