//! Broker consumer loop.
//!
//! Subscribes to one queue per registered event type, decodes each message
//! through the [`EventRegistry`], and re-dispatches it onto the local bus so
//! in-process handlers run unmodified. Undecodable messages are nacked into
//! the broker's dead-letter queue; handler failures are absorbed by the bus
//! and never block the ack.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::broker::{BrokerAdapter, BrokerError, IncomingMessage, MessageHandler, Result};
use crate::bus::{HandlerError, LocalEventBus};
use crate::event::{EventEnvelope, EventError, EventRegistry};
use crate::monitoring::EventMonitor;

/// Event ids already dispatched, oldest evicted first.
struct SeenEvents {
    capacity: usize,
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
}

impl SeenEvents {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Record `id`; false when it was already recorded.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }
}

/// Wires broker queues to the local bus.
pub struct EventConsumer {
    broker: Arc<dyn BrokerAdapter>,
    registry: Arc<EventRegistry>,
    bus: Arc<LocalEventBus>,
    monitor: Option<Arc<EventMonitor>>,
    dedupe_capacity: Option<usize>,
    /// Shared by every subscription, built on first subscribe.
    handler: OnceLock<Arc<RedispatchHandler>>,
}

impl EventConsumer {
    pub fn new(
        broker: Arc<dyn BrokerAdapter>,
        registry: Arc<EventRegistry>,
        bus: Arc<LocalEventBus>,
    ) -> Self {
        Self {
            broker,
            registry,
            bus,
            monitor: None,
            dedupe_capacity: None,
            handler: OnceLock::new(),
        }
    }

    /// Raise an alert for every undecodable message.
    pub fn with_monitor(mut self, monitor: Arc<EventMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Skip redeliveries of the last `capacity` event ids seen by this process.
    pub fn with_dedupe(mut self, capacity: usize) -> Self {
        self.dedupe_capacity = Some(capacity);
        self
    }

    pub fn handler(&self) -> Arc<RedispatchHandler> {
        self.handler
            .get_or_init(|| {
                Arc::new(RedispatchHandler {
                    registry: self.registry.clone(),
                    bus: self.bus.clone(),
                    monitor: self.monitor.clone(),
                    seen: self
                        .dedupe_capacity
                        .map(|capacity| Mutex::new(SeenEvents::new(capacity))),
                })
            })
            .clone()
    }

    /// Start consuming `event_type`'s queue.
    pub async fn subscribe(&self, event_type: &str) -> Result<()> {
        if !self.registry.contains(event_type) {
            return Err(BrokerError::Subscribe(format!(
                "Event type '{}' is not registered",
                event_type
            )));
        }
        self.broker
            .subscribe(event_type, self.handler() as Arc<dyn MessageHandler>)
            .await?;
        info!(event_type = %event_type, "Consuming event type");
        Ok(())
    }

    /// Start consuming every registered event type. Returns how many.
    pub async fn subscribe_all(&self) -> Result<usize> {
        let event_types = self.registry.event_types();
        for event_type in &event_types {
            self.subscribe(event_type).await?;
        }
        Ok(event_types.len())
    }
}

/// Per-message callback: decode, dispatch locally, then ack.
pub struct RedispatchHandler {
    registry: Arc<EventRegistry>,
    bus: Arc<LocalEventBus>,
    monitor: Option<Arc<EventMonitor>>,
    seen: Option<Mutex<SeenEvents>>,
}

impl RedispatchHandler {
    async fn reject(&self, message: &IncomingMessage, error: EventError) -> HandlerError {
        error!(
            routing_key = %message.routing_key,
            message_id = ?message.message_id,
            error = %error,
            "Undecodable message, dead-lettering"
        );
        if let Some(monitor) = &self.monitor {
            monitor
                .record_undeliverable_message(message.message_type.as_deref(), &error.to_string())
                .await;
        }
        Box::new(error)
    }
}

#[async_trait]
impl MessageHandler for RedispatchHandler {
    async fn handle(&self, message: IncomingMessage) -> std::result::Result<(), HandlerError> {
        let envelope = match EventEnvelope::from_bytes(&message.body) {
            Ok(envelope) => envelope,
            Err(e) => return Err(self.reject(&message, e).await),
        };
        let event = match self.registry.decode(&envelope) {
            Ok(event) => event,
            Err(e) => return Err(self.reject(&message, e).await),
        };

        // Claimed before dispatch so concurrent redeliveries run it once.
        if let Some(seen) = &self.seen {
            if !seen.lock().await.insert(envelope.event_id) {
                debug!(event_id = %envelope.event_id, "Duplicate delivery skipped");
                return Ok(());
            }
        }

        let report = self.bus.dispatch(event).await;
        debug!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Re-dispatched broker message"
        );
        Ok(())
    }
}
