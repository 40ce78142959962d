//! Broker abstraction for room fan-out.
//!
//! The relay talks to the broker through this trait so the subscription
//! manager can be exercised against an in-memory double; the production
//! implementation is [`crate::amqp::AmqpBroker`].

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Callback invoked for each message delivered on a subscription.
///
/// Returning `Err` makes the broker reject the delivery without requeue;
/// returning `Ok` acknowledges it (at-least-once semantics). A closed
/// recipient transport is not an error: implementations drop the
/// message and return `Ok`.
pub type DeliveryCallback = Arc<dyn Fn(Bytes) -> Result<()> + Send + Sync>;

/// An active broker-level subscription, owned by exactly one
/// (connection, room) pair.
#[derive(Debug)]
pub struct SubscriptionHandle {
    room_id: String,
    consumer_tag: String,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Create a handle for a consumer.
    #[must_use]
    pub fn new(room_id: impl Into<String>, consumer_tag: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            consumer_tag: consumer_tag.into(),
            task: None,
        }
    }

    /// Attach the delivery task draining the consumer.
    #[must_use]
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Room this subscription is bound to.
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Broker-level consumer tag.
    #[must_use]
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Stop the delivery task, if any.
    pub fn abort(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// A topic-exchange broker multiplexed across all rooms and
/// connections. Implementations own exactly one network connection and
/// one channel and must be internally thread-safe.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Idempotently declare the routing topology for a room. Safe to
    /// call repeatedly.
    async fn ensure(&self, room_id: &str) -> Result<()>;

    /// Publish a payload to a room's topic, asking the broker to retain
    /// it until consumed.
    async fn publish(&self, room_id: &str, payload: Bytes) -> Result<()>;

    /// Attach a consumer to a room's topic on an exclusive, auto-named
    /// queue.
    async fn subscribe(&self, room_id: &str, on_message: DeliveryCallback)
        -> Result<SubscriptionHandle>;

    /// Cancel a consumer. The exclusive queue is reclaimed by the
    /// broker once unbound.
    async fn cancel(&self, handle: SubscriptionHandle) -> Result<()>;
}
