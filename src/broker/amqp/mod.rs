//! AMQP (RabbitMQ) broker adapter.
//!
//! Events go to a durable topic exchange with the event type as routing key.
//! Each event type gets a durable queue whose dead-letter exchange routes
//! nacked or expired messages to `{queue}.dlq`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ExchangeKind,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::{
    AmqpConfig, BrokerAdapter, BrokerError, IncomingMessage, MessageHandler, QueueType, Result,
    Topology,
};
use crate::event::EventEnvelope;

/// Broker adapter backed by RabbitMQ.
pub struct AmqpBroker {
    config: AmqpConfig,
    topology: Topology,
    pool: Pool,
    /// Confirm-mode channel shared by all publishes.
    publish_channel: RwLock<Option<Channel>>,
    /// Event types whose queues have been declared on this connection.
    declared: RwLock<HashSet<String>>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    consumers: TaskTracker,
}

impl AmqpBroker {
    /// Build the adapter. No connection is made until [`BrokerAdapter::connect`].
    pub fn new(config: AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| BrokerError::Connection(format!("Failed to create pool: {}", e)))?;

        Ok(Self {
            topology: config.topology(),
            config,
            pool,
            publish_channel: RwLock::new(None),
            declared: RwLock::new(HashSet::new()),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            consumers: TaskTracker::new(),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Get a fresh channel from the pool.
    async fn open_channel(pool: &Pool) -> Result<Channel> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            BrokerError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to create channel: {}", e)))
    }

    /// Declare the events exchange and the dead-letter exchange.
    async fn declare_exchanges(channel: &Channel, topology: &Topology) -> Result<()> {
        let durable = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };

        channel
            .exchange_declare(
                &topology.exchange(),
                ExchangeKind::Topic,
                durable,
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to declare exchange: {}", e)))?;

        channel
            .exchange_declare(
                &topology.dead_letter_exchange(),
                ExchangeKind::Direct,
                durable,
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BrokerError::Topology(format!("Failed to declare dead-letter exchange: {}", e))
            })?;

        Ok(())
    }

    /// Declare and bind `event_type`'s queue and dead-letter queue.
    async fn declare_queue(
        channel: &Channel,
        topology: &Topology,
        config: &AmqpConfig,
        event_type: &str,
    ) -> Result<()> {
        let durable = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };
        let dlq = topology.dead_letter_queue(event_type);
        let queue = topology.queue(event_type);

        channel
            .queue_declare(&dlq, durable, FieldTable::default())
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to declare {}: {}", dlq, e)))?;
        channel
            .queue_bind(
                &dlq,
                &topology.dead_letter_exchange(),
                &topology.dead_letter_routing_key(event_type),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to bind {}: {}", dlq, e)))?;

        channel
            .queue_declare(&queue, durable, queue_arguments(topology, config, event_type))
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to declare {}: {}", queue, e)))?;
        channel
            .queue_bind(
                &queue,
                &topology.exchange(),
                &topology.routing_key(event_type),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to bind {}: {}", queue, e)))?;

        info!(queue = %queue, dead_letter_queue = %dlq, "Declared event queue");
        Ok(())
    }

    /// Publish channel, reopened if the previous one was lost.
    async fn publish_channel(&self) -> Result<Channel> {
        if let Some(channel) = self.publish_channel.read().await.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        if self.shutdown.is_cancelled() {
            return Err(BrokerError::NotConnected);
        }

        let channel = self.open_publish_channel().await?;
        *self.publish_channel.write().await = Some(channel.clone());
        // Queues on a new connection may be gone; redeclare lazily.
        self.declared.write().await.clear();
        Ok(channel)
    }

    async fn open_publish_channel(&self) -> Result<Channel> {
        let channel = match Self::open_channel(&self.pool).await {
            Ok(channel) => channel,
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to enable confirms: {}", e)))?;
        Self::declare_exchanges(&channel, &self.topology).await?;

        self.connected.store(true, Ordering::SeqCst);
        Ok(channel)
    }

    async fn ensure_queue(&self, channel: &Channel, event_type: &str) -> Result<()> {
        if self.declared.read().await.contains(event_type) {
            return Ok(());
        }
        Self::declare_queue(channel, &self.topology, &self.config, event_type).await?;
        self.declared.write().await.insert(event_type.to_string());
        Ok(())
    }

    /// Consumer loop with automatic reconnection and exponential backoff with jitter.
    async fn consume_with_reconnect(
        pool: Pool,
        topology: Topology,
        config: AmqpConfig,
        event_type: String,
        handler: Arc<dyn MessageHandler>,
        connected: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) {
        use futures::StreamExt;

        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();
        let mut backoff_iter = backoff_builder.build();
        let queue = topology.queue(&event_type);

        loop {
            match Self::setup_consumer(&pool, &topology, &config, &event_type).await {
                Ok(mut consumer) => {
                    info!(queue = %queue, "Consumer connected, processing messages");
                    connected.store(true, Ordering::SeqCst);
                    backoff_iter = backoff_builder.build();

                    loop {
                        let delivery = tokio::select! {
                            _ = shutdown.cancelled() => {
                                info!(queue = %queue, "Consumer stopping");
                                return;
                            }
                            delivery = consumer.next() => delivery,
                        };

                        match delivery {
                            Some(Ok(delivery)) => {
                                Self::process_delivery(delivery, handler.as_ref()).await;
                            }
                            Some(Err(e)) => {
                                error!(queue = %queue, error = %e, "Consumer delivery error, will reconnect");
                                break;
                            }
                            None => {
                                error!(queue = %queue, "Consumer stream ended, will reconnect");
                                break;
                            }
                        }
                    }
                    connected.store(false, Ordering::SeqCst);
                }
                Err(e) => {
                    connected.store(false, Ordering::SeqCst);
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        queue = %queue,
                        "Failed to set up consumer, retrying after backoff"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            }

            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn setup_consumer(
        pool: &Pool,
        topology: &Topology,
        config: &AmqpConfig,
        event_type: &str,
    ) -> Result<lapin::Consumer> {
        let channel = Self::open_channel(pool).await?;

        channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Subscribe(format!("Failed to set prefetch: {}", e)))?;
        Self::declare_exchanges(&channel, topology).await?;
        Self::declare_queue(&channel, topology, config, event_type).await?;

        channel
            .basic_consume(
                &topology.queue(event_type),
                &format!("courier-{}", event_type),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Subscribe(format!("Failed to start consumer: {}", e)))
    }

    /// Hand one delivery to the handler; ack on success, nack without requeue on error.
    async fn process_delivery(delivery: lapin::message::Delivery, handler: &dyn MessageHandler) {
        let message = IncomingMessage {
            body: delivery.data.clone(),
            message_id: delivery
                .properties
                .message_id()
                .as_ref()
                .map(|id| id.as_str().to_string()),
            message_type: delivery
                .properties
                .kind()
                .as_ref()
                .map(|k| k.as_str().to_string()),
            routing_key: delivery.routing_key.as_str().to_string(),
            redelivered: delivery.redelivered,
        };

        debug!(
            routing_key = %message.routing_key,
            message_id = ?message.message_id,
            redelivered = message.redelivered,
            "Received message"
        );

        match handler.handle(message).await {
            Ok(()) => {
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    error!(error = %e, "Failed to ack message");
                }
            }
            Err(e) => {
                warn!(
                    routing_key = %delivery.routing_key.as_str(),
                    error = %e,
                    "Message handling failed, nacking to dead-letter queue"
                );
                let nack = BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                };
                if let Err(e) = delivery.nack(nack).await {
                    error!(error = %e, "Failed to nack message");
                }
            }
        }
    }
}

/// Dead-letter policy arguments for an event queue.
fn queue_arguments(topology: &Topology, config: &AmqpConfig, event_type: &str) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(topology.dead_letter_exchange().into()),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(topology.dead_letter_routing_key(event_type).into()),
    );
    args.insert(
        "x-message-ttl".into(),
        AMQPValue::LongLongInt(config.message_ttl_ms.min(i64::MAX as u64) as i64),
    );
    args.insert(
        "x-queue-type".into(),
        AMQPValue::LongString(config.queue_type.as_str().into()),
    );
    if config.queue_type == QueueType::Quorum {
        args.insert(
            "x-delivery-limit".into(),
            AMQPValue::LongLongInt(i64::from(config.max_delivery_attempts)),
        );
    }
    args
}

/// Message properties carrying the envelope's identity.
fn message_properties(envelope: &EventEnvelope) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(
        "aggregateId".into(),
        AMQPValue::LongString(envelope.aggregate_id.clone().into()),
    );
    headers.insert(
        "aggregateType".into(),
        AMQPValue::LongString(envelope.aggregate_type.clone().into()),
    );
    headers.insert(
        "eventVersion".into(),
        AMQPValue::LongUInt(envelope.event_version),
    );

    BasicProperties::default()
        .with_message_id(envelope.event_id.to_string().into())
        .with_type(envelope.event_type.clone().into())
        .with_content_type("application/json".into())
        .with_delivery_mode(2) // persistent
        .with_timestamp(envelope.occurred_at.timestamp().max(0) as u64)
        .with_headers(headers)
}

#[async_trait]
impl BrokerAdapter for AmqpBroker {
    async fn connect(&self) -> Result<()> {
        self.publish_channel().await?;
        info!(
            exchange = %self.topology.exchange(),
            url = %self.config.url,
            "Connected to AMQP"
        );
        Ok(())
    }

    #[tracing::instrument(
        name = "broker.publish",
        skip_all,
        fields(event_id = %envelope.event_id, event_type = %envelope.event_type)
    )]
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()> {
        let payload = envelope.to_bytes()?;
        let channel = self.publish_channel().await?;
        self.ensure_queue(&channel, &envelope.event_type).await?;

        let confirm = match channel
            .basic_publish(
                &self.topology.exchange(),
                &self.topology.routing_key(&envelope.event_type),
                BasicPublishOptions::default(),
                &payload,
                message_properties(envelope),
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(e) => {
                // Drop the channel so the next publish reopens one.
                *self.publish_channel.write().await = None;
                return Err(BrokerError::Publish(format!("Failed to publish: {}", e)));
            }
        };

        let confirmation = confirm
            .await
            .map_err(|e| BrokerError::Publish(format!("Publish confirmation failed: {}", e)))?;
        if confirmation.is_nack() {
            return Err(BrokerError::Rejected(envelope.event_id.to_string()));
        }

        debug!(
            exchange = %self.topology.exchange(),
            routing_key = %envelope.event_type,
            "Published event"
        );
        Ok(())
    }

    async fn subscribe(&self, event_type: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Subscribe("Broker is closed".to_string()));
        }

        self.consumers.spawn(Self::consume_with_reconnect(
            self.pool.clone(),
            self.topology.clone(),
            self.config.clone(),
            event_type.to_string(),
            handler,
            self.connected.clone(),
            self.shutdown.child_token(),
        ));

        info!(event_type = %event_type, "Subscribed to event queue");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.consumers.close();
        self.consumers.wait().await;

        if let Some(channel) = self.publish_channel.write().await.take() {
            if let Err(e) = channel.close(200, "shutdown").await {
                warn!(error = %e, "Failed to close publish channel");
            }
        }
        self.pool.close();
        self.connected.store(false, Ordering::SeqCst);

        info!("AMQP broker closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        // A locked channel slot is being swapped by publish; trust the flag.
        let channel_connected = self
            .publish_channel
            .try_read()
            .ok()
            .and_then(|channel| channel.as_ref().map(|c| c.status().connected()));

        let healthy = connection_healthy(self.connected.load(Ordering::SeqCst), channel_connected);
        if !healthy && channel_connected == Some(false) {
            self.connected.store(false, Ordering::SeqCst);
        }
        healthy
    }
}

/// Connected only while the flag holds and the cached publish channel, if
/// any, is still open.
fn connection_healthy(flag: bool, publish_channel_connected: Option<bool>) -> bool {
    flag && publish_channel_connected.unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::test_utils::QuestionCreated;

    #[test]
    fn test_quorum_queue_arguments() {
        let topology = Topology::new("forum");
        let args = queue_arguments(&topology, &AmqpConfig::default(), "QuestionCreated");
        let inner = args.inner();

        assert_eq!(
            inner.get("x-dead-letter-exchange"),
            Some(&AMQPValue::LongString("forum.events.dlx".into()))
        );
        assert_eq!(
            inner.get("x-dead-letter-routing-key"),
            Some(&AMQPValue::LongString("QuestionCreated.dlq".into()))
        );
        assert_eq!(
            inner.get("x-message-ttl"),
            Some(&AMQPValue::LongLongInt(86_400_000))
        );
        assert_eq!(inner.get("x-delivery-limit"), Some(&AMQPValue::LongLongInt(3)));
    }

    #[test]
    fn test_classic_queue_has_no_delivery_limit() {
        let config = AmqpConfig {
            queue_type: QueueType::Classic,
            ..Default::default()
        };
        let args = queue_arguments(&Topology::default(), &config, "QuestionCreated");
        assert!(args.inner().get("x-delivery-limit").is_none());
        assert_eq!(
            args.inner().get("x-queue-type"),
            Some(&AMQPValue::LongString("classic".into()))
        );
    }

    #[test]
    fn test_message_properties_carry_identity() {
        let event = Event::new("q-9", QuestionCreated::new("Headers?"));
        let envelope = EventEnvelope::from_event(&event, "Question").unwrap();
        let properties = message_properties(&envelope);

        assert_eq!(
            properties.message_id().as_ref().map(|id| id.as_str().to_string()),
            Some(envelope.event_id.to_string())
        );
        assert_eq!(
            properties.kind().as_ref().map(|k| k.as_str().to_string()),
            Some("QuestionCreated".to_string())
        );
        assert_eq!(*properties.delivery_mode(), Some(2));

        let headers = properties.headers().as_ref().unwrap();
        assert_eq!(
            headers.inner().get("aggregateId"),
            Some(&AMQPValue::LongString("q-9".into()))
        );
        assert_eq!(
            headers.inner().get("eventVersion"),
            Some(&AMQPValue::LongUInt(1))
        );
    }

    #[test]
    fn test_dropped_publish_channel_is_unhealthy() {
        assert!(connection_healthy(true, Some(true)));
        assert!(connection_healthy(true, None));
        assert!(!connection_healthy(true, Some(false)));
        assert!(!connection_healthy(false, Some(true)));
        assert!(!connection_healthy(false, None));
    }

    #[test]
    fn test_new_does_not_connect() {
        let broker = AmqpBroker::new(AmqpConfig::default()).unwrap();
        assert!(!broker.is_connected());
        assert_eq!(broker.topology().exchange(), "courier.events");
    }
}
