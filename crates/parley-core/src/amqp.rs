//! AMQP (RabbitMQ) broker adapter.
//!
//! One topic exchange carries every room; the routing key is the room
//! id. The adapter owns exactly one connection and one channel,
//! multiplexed across all rooms and client connections, and fails fast
//! with `BrokerUnavailable` while disconnected.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, DeliveryCallback, SubscriptionHandle};
use crate::error::{RelayError, Result};

/// Settings for the AMQP adapter.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Topic exchange every room is routed through.
    pub exchange: String,
    /// Fixed delay between reconnection attempts.
    pub reconnect_interval: Duration,
}

/// The single connection/channel pair the adapter owns.
struct Link {
    connection: Connection,
    channel: Channel,
}

/// AMQP broker adapter over one shared topic-exchange channel.
pub struct AmqpBroker {
    settings: BrokerSettings,
    link: Arc<RwLock<Option<Link>>>,
    consumer_seq: AtomicU64,
}

impl AmqpBroker {
    /// Connect to the broker and declare the exchange.
    ///
    /// # Errors
    ///
    /// Returns `BrokerUnavailable` if the initial connection attempt
    /// fails; later drops are handled by the reconnect watchdog.
    pub async fn connect(settings: BrokerSettings) -> Result<Arc<Self>> {
        let broker = Arc::new(Self {
            settings,
            link: Arc::new(RwLock::new(None)),
            consumer_seq: AtomicU64::new(0),
        });
        broker.reconnect().await?;
        Ok(broker)
    }

    /// Spawn the reconnect watchdog: on a fixed interval, re-establish
    /// the link whenever the channel has gone away.
    pub fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(broker.settings.reconnect_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if broker.is_connected().await {
                    continue;
                }
                warn!("Broker link lost, reconnecting");
                match broker.reconnect().await {
                    Ok(()) => {
                        metrics::counter!("parley_broker_reconnects_total").increment(1);
                    }
                    Err(err) => error!(error = %err, "Broker reconnection failed"),
                }
            }
        })
    }

    async fn is_connected(&self) -> bool {
        match &*self.link.read().await {
            Some(link) => link.channel.status().connected(),
            None => false,
        }
    }

    async fn reconnect(&self) -> Result<()> {
        let connection = Connection::connect(&self.settings.url, ConnectionProperties::default())
            .await
            .map_err(unavailable)?;
        let channel = connection.create_channel().await.map_err(unavailable)?;

        channel
            .exchange_declare(
                &self.settings.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(unavailable)?;

        info!(
            exchange = %self.settings.exchange,
            url = %self.settings.url,
            "Connected to AMQP"
        );

        *self.link.write().await = Some(Link {
            connection,
            channel,
        });
        Ok(())
    }

    /// The live channel, or `BrokerUnavailable` without blocking.
    async fn channel(&self) -> Result<Channel> {
        match &*self.link.read().await {
            Some(link) if link.channel.status().connected() => Ok(link.channel.clone()),
            _ => Err(RelayError::BrokerUnavailable("not connected".into())),
        }
    }

    /// Close the channel and connection for process shutdown.
    pub async fn shutdown(&self) {
        if let Some(link) = self.link.write().await.take() {
            if let Err(err) = link.channel.close(200, "shutdown").await {
                debug!(error = %err, "Channel close failed during shutdown");
            }
            if let Err(err) = link.connection.close(200, "shutdown").await {
                debug!(error = %err, "Connection close failed during shutdown");
            }
            info!("AMQP disconnected");
        }
    }
}

fn unavailable(err: lapin::Error) -> RelayError {
    RelayError::BrokerUnavailable(err.to_string())
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn ensure(&self, room_id: &str) -> Result<()> {
        let channel = self.channel().await?;

        channel
            .queue_declare(
                room_id,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(unavailable)?;

        channel
            .queue_bind(
                room_id,
                &self.settings.exchange,
                room_id,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(unavailable)?;

        Ok(())
    }

    async fn publish(&self, room_id: &str, payload: Bytes) -> Result<()> {
        let channel = self.channel().await?;

        let confirm = channel
            .basic_publish(
                &self.settings.exchange,
                room_id,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2), // persistent
            )
            .await
            .map_err(unavailable)?;
        confirm.await.map_err(unavailable)?;

        debug!(room = %room_id, bytes = payload.len(), "Published to broker");
        Ok(())
    }

    async fn subscribe(
        &self,
        room_id: &str,
        on_message: DeliveryCallback,
    ) -> Result<SubscriptionHandle> {
        let channel = self.channel().await?;

        // Exclusive server-named queue per subscriber; fan-out happens
        // at the exchange.
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(unavailable)?;

        channel
            .queue_bind(
                queue.name().as_str(),
                &self.settings.exchange,
                room_id,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(unavailable)?;

        let consumer_tag = format!(
            "parley-{}",
            self.consumer_seq.fetch_add(1, Ordering::Relaxed)
        );
        let mut consumer = channel
            .basic_consume(
                queue.name().as_str(),
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(unavailable)?;

        let room = room_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let payload = Bytes::copy_from_slice(&delivery.data);
                        match on_message(payload) {
                            Ok(()) => {
                                if let Err(err) = delivery.ack(Default::default()).await {
                                    error!(room = %room, error = %err, "Failed to ack delivery");
                                }
                            }
                            Err(err) => {
                                // Malformed payload; requeueing would loop.
                                warn!(room = %room, error = %err, "Rejecting delivery");
                                let _ = delivery
                                    .reject(BasicRejectOptions { requeue: false })
                                    .await;
                            }
                        }
                    }
                    Err(err) => {
                        error!(room = %room, error = %err, "Consumer delivery error");
                        break;
                    }
                }
            }
            debug!(room = %room, "Consumer stream ended");
        });

        debug!(room = %room_id, consumer = %consumer_tag, "Subscribed to room topic");
        Ok(SubscriptionHandle::new(room_id, consumer_tag).with_task(task))
    }

    async fn cancel(&self, handle: SubscriptionHandle) -> Result<()> {
        // If the channel is gone the broker reaps the consumer with it;
        // only a live channel needs an explicit cancel.
        let result = match self.channel().await {
            Ok(channel) => channel
                .basic_cancel(handle.consumer_tag(), BasicCancelOptions::default())
                .await
                .map_err(unavailable),
            Err(_) => Ok(()),
        };

        handle.abort();
        result
    }
}
