//! In-process topic/subscription broker.
//!
//! Models the peek-lock semantics the relay relies on: a received message is
//! locked until it is completed, abandoned (redelivered with a higher
//! delivery count) or moved to the subscription's dead-letter store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::envelope::Envelope;
use crate::error::BrokerError;

/// A message that exhausted its deliveries or could not be decoded.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub delivery_count: u32,
    pub reason: String,
    pub description: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// A locked message handed to a receiver.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub envelope: Envelope,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
    lock_token: u64,
}

#[derive(Debug, Clone)]
struct Queued {
    envelope: Envelope,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Queued>,
    locked: HashMap<u64, Queued>,
    dead_letters: Vec<DeadLetter>,
    next_lock: u64,
}

#[derive(Debug, Default)]
struct SubscriptionQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl SubscriptionQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, envelope: Envelope) {
        self.lock().ready.push_back(Queued {
            envelope,
            delivery_count: 0,
        });
        self.available.notify_one();
    }
}

#[derive(Debug, Default)]
struct Topic {
    subscriptions: HashMap<String, Arc<SubscriptionQueue>>,
}

/// Shared handle to an in-process broker. Clones refer to the same topics.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates the topic if it does not exist yet.
    pub fn create_topic(&self, topic: &str) {
        self.topics().entry(topic.to_string()).or_default();
    }

    /// Creates (or reopens) a subscription, creating the topic as needed.
    ///
    /// Messages sent to the topic before the subscription existed are not
    /// delivered to it.
    pub fn create_subscription(&self, topic: &str, subscription: &str) -> Receiver {
        let queue = self
            .topics()
            .entry(topic.to_string())
            .or_default()
            .subscriptions
            .entry(subscription.to_string())
            .or_default()
            .clone();

        Receiver {
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            queue,
        }
    }

    /// Opens a receiver on an existing subscription.
    pub fn receiver(&self, topic: &str, subscription: &str) -> Result<Receiver, BrokerError> {
        let topics = self.topics();
        let queue = topics
            .get(topic)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?
            .subscriptions
            .get(subscription)
            .ok_or_else(|| BrokerError::SubscriptionNotFound {
                topic: topic.to_string(),
                subscription: subscription.to_string(),
            })?
            .clone();

        Ok(Receiver {
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            queue,
        })
    }

    /// Fans a message out to every subscription of the topic.
    ///
    /// Returns the number of subscriptions that received a copy.
    pub fn send(&self, topic: &str, envelope: Envelope) -> Result<usize, BrokerError> {
        let queues: Vec<Arc<SubscriptionQueue>> = self
            .topics()
            .get(topic)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?
            .subscriptions
            .values()
            .cloned()
            .collect();

        for queue in &queues {
            queue.push(envelope.clone());
        }
        Ok(queues.len())
    }
}

/// Receiving end of one subscription. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Receiver {
    topic: String,
    subscription: String,
    queue: Arc<SubscriptionQueue>,
}

impl Receiver {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Waits for the next message, or returns `None` once `cancel` fires.
    pub async fn receive(&self, cancel: &CancellationToken) -> Option<ReceivedMessage> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(message) = self.try_receive() {
                return Some(message);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.queue.available.notified() => {}
            }
        }
    }

    /// Locks and returns the next ready message without waiting.
    pub fn try_receive(&self) -> Option<ReceivedMessage> {
        let mut state = self.queue.lock();
        let mut queued = state.ready.pop_front()?;
        queued.delivery_count += 1;

        state.next_lock += 1;
        let lock_token = state.next_lock;
        let message = ReceivedMessage {
            envelope: queued.envelope.clone(),
            delivery_count: queued.delivery_count,
            lock_token,
        };
        state.locked.insert(lock_token, queued);

        // Another waiter may be able to take the next message.
        if !state.ready.is_empty() {
            self.queue.available.notify_one();
        }
        Some(message)
    }

    /// Removes the message from the subscription.
    pub fn complete(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        self.queue
            .lock()
            .locked
            .remove(&message.lock_token)
            .map(|_| ())
            .ok_or(BrokerError::LockLost(message.lock_token))
    }

    /// Releases the lock and makes the message immediately redeliverable.
    pub fn abandon(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        let mut state = self.queue.lock();
        let queued = state
            .locked
            .remove(&message.lock_token)
            .ok_or(BrokerError::LockLost(message.lock_token))?;
        state.ready.push_front(queued);
        drop(state);
        self.queue.available.notify_one();
        Ok(())
    }

    /// Moves the message to the dead-letter store with a reason.
    pub fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: &str,
        description: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.queue.lock();
        let queued = state
            .locked
            .remove(&message.lock_token)
            .ok_or(BrokerError::LockLost(message.lock_token))?;
        state.dead_letters.push(DeadLetter {
            envelope: queued.envelope,
            delivery_count: queued.delivery_count,
            reason: reason.to_string(),
            description: description.to_string(),
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }

    /// Snapshot of the dead-letter store.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.queue.lock().dead_letters.clone()
    }

    /// Messages waiting to be received.
    pub fn ready_count(&self) -> usize {
        self.queue.lock().ready.len()
    }

    /// Messages received but not yet settled.
    pub fn locked_count(&self) -> usize {
        self.queue.lock().locked.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(id: &str) -> Envelope {
        Envelope::new(id, "NotificationCreatedEvent", "{}", Utc::now())
    }

    #[test]
    fn send_to_unknown_topic_fails() {
        let broker = InMemoryBroker::new();
        let err = broker
            .send("missing", envelope("m-1"))
            .expect_err("unknown topic should be rejected");
        assert!(matches!(err, BrokerError::TopicNotFound(t) if t == "missing"));
    }

    #[test]
    fn send_fans_out_to_every_subscription() {
        let broker = InMemoryBroker::new();
        let a = broker.create_subscription("events", "a");
        let b = broker.create_subscription("events", "b");

        let delivered = broker.send("events", envelope("m-1")).expect("should send");
        assert_eq!(delivered, 2);
        assert_eq!(a.ready_count(), 1);
        assert_eq!(b.ready_count(), 1);
    }

    #[test]
    fn abandon_redelivers_with_incremented_count() {
        let broker = InMemoryBroker::new();
        let rx = broker.create_subscription("events", "sub");
        broker.send("events", envelope("m-1")).expect("should send");

        let first = rx.try_receive().expect("first delivery");
        assert_eq!(first.delivery_count, 1);
        rx.abandon(&first).expect("should abandon");

        let second = rx.try_receive().expect("second delivery");
        assert_eq!(second.delivery_count, 2);
        assert_eq!(second.envelope.message_id, "m-1");
    }

    #[test]
    fn settling_twice_reports_lost_lock() {
        let broker = InMemoryBroker::new();
        let rx = broker.create_subscription("events", "sub");
        broker.send("events", envelope("m-1")).expect("should send");

        let message = rx.try_receive().expect("delivery");
        rx.complete(&message).expect("first complete");
        assert!(matches!(
            rx.complete(&message),
            Err(BrokerError::LockLost(_))
        ));
        assert_eq!(rx.locked_count(), 0);
    }

    #[test]
    fn dead_letter_records_reason() {
        let broker = InMemoryBroker::new();
        let rx = broker.create_subscription("events", "sub");
        broker.send("events", envelope("m-1")).expect("should send");

        let message = rx.try_receive().expect("delivery");
        rx.dead_letter(&message, "ProcessingFailed", "boom")
            .expect("should dead-letter");

        let letters = rx.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, "ProcessingFailed");
        assert_eq!(letters[0].description, "boom");
        assert_eq!(rx.ready_count(), 0);
    }

    #[test]
    fn receiver_for_unknown_subscription_fails() {
        let broker = InMemoryBroker::new();
        broker.create_topic("events");
        assert!(matches!(
            broker.receiver("events", "nope"),
            Err(BrokerError::SubscriptionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn receive_wakes_on_send() {
        let broker = InMemoryBroker::new();
        let rx = broker.create_subscription("events", "sub");
        let cancel = CancellationToken::new();

        let waiter = {
            let rx = rx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { rx.receive(&cancel).await })
        };
        tokio::task::yield_now().await;
        broker.send("events", envelope("m-1")).expect("should send");

        let message = waiter
            .await
            .expect("task should join")
            .expect("should receive a message");
        assert_eq!(message.envelope.message_id, "m-1");
    }

    #[tokio::test]
    async fn receive_returns_none_on_cancel() {
        let broker = InMemoryBroker::new();
        let rx = broker.create_subscription("events", "sub");
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(rx.receive(&cancel).await.is_none());
    }
}
