//! Notification queue and delivery state machine for the Scholar event relay.
//!
//! Notifications are rows in the `notifications` table. Producers insert
//! them as `Pending`; a [`Dispatcher`] claims them one at a time
//! (`Pending → Processing`), hands them to a [`NotificationSender`], and
//! records `Sent`, `Delivered` or `Failed`. The retry loop moves eligible
//! `Failed` rows back to `Pending` on the backoff schedule in [`retry`].
//!
//! Claims are single conditional `UPDATE ... RETURNING` statements, so any
//! number of dispatchers may share one database without double delivery of
//! the same claim.

mod dispatcher;
mod error;
mod model;
mod queue;
pub mod retry;
mod sender;
mod store;

pub use dispatcher::{deliver, Dispatcher, DispatcherConfig};
pub use error::{NotifyError, SendError};
pub use model::{NewNotification, Notification, NotificationContent, Recipient};
pub use queue::NotificationQueue;
pub use retry::{is_retry_eligible, next_retry_time};
pub use sender::{DeliveryReceipt, LogSender, NotificationSender};
pub use store::{
    cancel, claim, count_ready, delete_finished_before, expire_stale_claims, find_by_correlation,
    get, insert, insert_once, list_retry_due, mark_delivered, mark_failed, mark_sent,
    ready_candidates, rearm, status_counts, StatusCounts, CLAIM_EXPIRED_ERROR,
    NEVER_DUE_RETRY_COUNT,
};

#[cfg(test)]
mod tests;
