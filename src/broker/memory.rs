//! In-memory broker for tests and single-process setups.
//!
//! Publishing appends to a per-event-type queue; [`InMemoryBroker::deliver_pending`]
//! drains those queues into the subscribed handlers, acking or dead-lettering
//! each message like a real broker would.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::{BrokerAdapter, BrokerError, IncomingMessage, MessageHandler, Result, Topology};
use crate::event::EventEnvelope;

/// A message the consumer nacked, with the handler's error.
#[derive(Debug, Clone)]
pub struct DeadLetteredMessage {
    pub message: IncomingMessage,
    pub reason: String,
}

pub struct InMemoryBroker {
    topology: Topology,
    connected: AtomicBool,
    fail_on_publish: AtomicBool,
    reject_next: AtomicU32,
    published: RwLock<Vec<EventEnvelope>>,
    queues: Mutex<HashMap<String, VecDeque<IncomingMessage>>>,
    subscribers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    acked: RwLock<Vec<IncomingMessage>>,
    dead_lettered: RwLock<Vec<DeadLetteredMessage>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            topology: Topology::default(),
            connected: AtomicBool::new(false),
            fail_on_publish: AtomicBool::new(false),
            reject_next: AtomicU32::new(0),
            published: RwLock::new(Vec::new()),
            queues: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            acked: RwLock::new(Vec::new()),
            dead_lettered: RwLock::new(Vec::new()),
        }
    }

    /// Fail every publish with a connection error until cleared.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    /// Reject the next `count` publishes, as a broker nack would.
    pub fn reject_next(&self, count: u32) {
        self.reject_next.store(count, Ordering::SeqCst);
    }

    /// Simulate a dropped connection.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<EventEnvelope> {
        self.published.read().await.clone()
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<EventEnvelope> {
        std::mem::take(&mut *self.published.write().await)
    }

    pub async fn acked(&self) -> Vec<IncomingMessage> {
        self.acked.read().await.clone()
    }

    pub async fn dead_lettered(&self) -> Vec<DeadLetteredMessage> {
        self.dead_lettered.read().await.clone()
    }

    /// Messages waiting in `event_type`'s queue.
    pub async fn queued(&self, event_type: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(event_type)
            .map_or(0, VecDeque::len)
    }

    /// Enqueue a raw body, bypassing envelope serialization.
    pub async fn inject_raw(&self, event_type: &str, body: Vec<u8>) {
        let message = IncomingMessage {
            body,
            message_id: None,
            message_type: Some(event_type.to_string()),
            routing_key: self.topology.routing_key(event_type),
            redelivered: false,
        };
        self.enqueue(event_type, message).await;
    }

    /// Deliver every queued message that has a subscriber. Returns how many
    /// were handed to a handler.
    pub async fn deliver_pending(&self) -> usize {
        let subscribers = self.subscribers.read().await.clone();
        let mut delivered = 0;

        for (event_type, handler) in subscribers {
            loop {
                // Lock released before the handler runs, so it may publish.
                let next = self
                    .queues
                    .lock()
                    .await
                    .get_mut(&event_type)
                    .and_then(VecDeque::pop_front);
                let Some(message) = next else {
                    break;
                };

                delivered += 1;
                match handler.handle(message.clone()).await {
                    Ok(()) => self.acked.write().await.push(message),
                    Err(e) => {
                        warn!(
                            event_type = %event_type,
                            error = %e,
                            "Message nacked, routed to dead-letter queue"
                        );
                        self.dead_lettered.write().await.push(DeadLetteredMessage {
                            message,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        delivered
    }

    async fn enqueue(&self, event_type: &str, message: IncomingMessage) {
        self.queues
            .lock()
            .await
            .entry(event_type.to_string())
            .or_default()
            .push_back(message);
    }
}

#[async_trait]
impl BrokerAdapter for InMemoryBroker {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, envelope: &EventEnvelope) -> Result<()> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("In-memory publish failure".to_string()));
        }
        let rejected = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(BrokerError::Rejected(envelope.event_id.to_string()));
        }

        let message = IncomingMessage {
            body: envelope.to_bytes()?,
            message_id: Some(envelope.event_id.to_string()),
            message_type: Some(envelope.event_type.clone()),
            routing_key: self.topology.routing_key(&envelope.event_type),
            redelivered: false,
        };
        self.enqueue(&envelope.event_type, message).await;
        self.published.write().await.push(envelope.clone());

        debug!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            "Published to in-memory broker"
        );
        Ok(())
    }

    async fn subscribe(&self, event_type: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        self.subscribers
            .write()
            .await
            .insert(event_type.to_string(), handler);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.subscribers.write().await.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
