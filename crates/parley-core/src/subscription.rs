//! Room subscription management.
//!
//! A [`SubscriptionManager`] binds one authenticated client connection
//! to its active room subscriptions: it performs history backfill on
//! join, persists and republishes outgoing messages, and guarantees
//! cleanup on leave and disconnect. Each manager is owned by its
//! connection's task; broker delivery tasks never touch it, they only
//! enqueue frames onto the connection's outbound queue.

use bytes::Bytes;
use parley_protocol::{Frame, MessageRecord};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{Broker, DeliveryCallback, SubscriptionHandle};
use crate::error::{RelayError, Result};
use crate::store::{now_millis, MessageStore};

/// Bounds on relay operations.
#[derive(Debug, Clone)]
pub struct RelayLimits {
    /// Number of messages sent in a history backfill.
    pub history_limit: usize,
    /// Upper bound on any single store or broker call.
    pub op_timeout: Duration,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            history_limit: 20,
            op_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-connection subscription state. Exists only for authenticated
/// connections; the gateway constructs it after AUTH succeeds.
pub struct SubscriptionManager {
    username: String,
    broker: Arc<dyn Broker>,
    store: Arc<dyn MessageStore>,
    limits: RelayLimits,
    outbound: mpsc::UnboundedSender<Frame>,
    /// At most one handle per room.
    subscriptions: HashMap<String, SubscriptionHandle>,
}

impl SubscriptionManager {
    /// Create a manager for an authenticated connection.
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        broker: Arc<dyn Broker>,
        store: Arc<dyn MessageStore>,
        limits: RelayLimits,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            username: username.into(),
            broker,
            store,
            limits,
            outbound,
            subscriptions: HashMap::new(),
        }
    }

    /// Username the connection authenticated as.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Number of active room subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Check whether a room subscription is active.
    #[must_use]
    pub fn is_subscribed(&self, room_id: &str) -> bool {
        self.subscriptions.contains_key(room_id)
    }

    /// Join a room: verify it exists, attach a broker consumer (no-op
    /// if one is already active), then backfill history.
    ///
    /// Consumer registration happens before the backfill read, so no
    /// broker message published in between is lost; a message may show
    /// up both in the backfill and live, which clients resolve by
    /// deduplicating on message id.
    ///
    /// # Errors
    ///
    /// `RoomNotFound` for an unknown room, `StoreUnavailable` /
    /// `BrokerUnavailable` when a dependency fails or times out. On
    /// error no frames have been enqueued for this join.
    pub async fn join(&mut self, room_id: &str) -> Result<()> {
        let room = self
            .store_call(self.store.find_room(room_id))
            .await?
            .ok_or_else(|| RelayError::RoomNotFound(room_id.to_string()))?;

        if self.subscriptions.contains_key(room_id) {
            debug!(user = %self.username, room = %room_id, "Already subscribed, reusing consumer");
        } else {
            self.broker_call(self.broker.ensure(room_id)).await?;
            let callback = delivery_callback(self.outbound.clone());
            let handle = self
                .broker_call(self.broker.subscribe(room_id, callback))
                .await?;
            self.subscriptions.insert(room_id.to_string(), handle);
        }

        self.push(Frame::join_success(room_id, room.name));

        let mut history = self
            .store_call(self.store.recent_messages(room_id, self.limits.history_limit))
            .await?;
        history.reverse(); // store returns newest-first
        let records = history.into_iter().map(MessageRecord::from).collect();
        self.push(Frame::message_history(room_id, records));

        info!(user = %self.username, room = %room_id, "Joined room");
        Ok(())
    }

    /// Leave a room. Idempotent: leaving a room with no active
    /// subscription still acknowledges with `LEAVE_SUCCESS`.
    pub async fn leave(&mut self, room_id: &str) -> Result<()> {
        if let Some(handle) = self.subscriptions.remove(room_id) {
            if let Err(err) = self.broker_call(self.broker.cancel(handle)).await {
                warn!(user = %self.username, room = %room_id, error = %err, "Consumer cancel failed");
            }
            info!(user = %self.username, room = %room_id, "Left room");
        }
        self.push(Frame::leave_success(room_id));
        Ok(())
    }

    /// Relay a message: persist, then publish to the room topic.
    ///
    /// The sender sees its own message only through the broker fan-out;
    /// there is no local echo, so every subscriber observes one
    /// consistent delivery order.
    ///
    /// # Errors
    ///
    /// If persistence fails nothing is published. If the publish fails
    /// after a successful persist, the message is durably stored and
    /// will surface through history backfill; the error is still
    /// surfaced so the client knows live delivery did not happen.
    pub async fn send(&mut self, room_id: &str, content: &str) -> Result<()> {
        if content.is_empty() {
            return Err(RelayError::InvalidFrame("message content is empty".into()));
        }

        let message = self
            .store_call(
                self.store
                    .append_message(room_id, &self.username, content, now_millis()),
            )
            .await?;

        let frame = Frame::NewMessage(MessageRecord::from(message));
        let payload = serde_json::to_vec(&frame)
            .map_err(|err| RelayError::InvalidFrame(err.to_string()))?;
        self.broker_call(self.broker.publish(room_id, Bytes::from(payload)))
            .await?;

        debug!(user = %self.username, room = %room_id, "Message relayed");
        Ok(())
    }

    /// Release every subscription this connection owns. Idempotent and
    /// unconditional: cancellation failures are logged, never retried.
    pub async fn shutdown(&mut self) {
        for (room_id, handle) in self.subscriptions.drain() {
            match tokio::time::timeout(self.limits.op_timeout, self.broker.cancel(handle)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(user = %self.username, room = %room_id, error = %err, "Cleanup cancel failed");
                }
                Err(_) => {
                    warn!(user = %self.username, room = %room_id, "Cleanup cancel timed out");
                }
            }
        }
    }

    /// Enqueue a frame for the connection's writer task. A closed
    /// connection drops the frame.
    fn push(&self, frame: Frame) {
        let _ = self.outbound.send(frame);
    }

    async fn store_call<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.limits.op_timeout, call)
            .await
            .map_err(|_| RelayError::StoreUnavailable("operation timed out".into()))?
    }

    async fn broker_call<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.limits.op_timeout, call)
            .await
            .map_err(|_| RelayError::BrokerUnavailable("operation timed out".into()))?
    }
}

/// Callback handed to the broker for each subscription: decode the
/// payload and enqueue it for the connection's single writer.
fn delivery_callback(outbound: mpsc::UnboundedSender<Frame>) -> DeliveryCallback {
    Arc::new(move |payload: Bytes| {
        let frame = serde_json::from_slice::<Frame>(&payload)
            .map_err(|err| RelayError::InvalidFrame(err.to_string()))?;
        // A closed transport is not an error; the message is simply
        // dropped for this recipient.
        let _ = outbound.send(frame);
        Ok(())
    })
}
