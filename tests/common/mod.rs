//! Shared fixtures for integration tests: an order aggregate, its events and
//! a channel-backed handler.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use courier::aggregate::{Aggregate, EventRecorder};
use courier::bus::{EventHandler, HandlerError};
use courier::event::{DomainEvent, EventPayload, EventRegistry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub customer_id: String,
    pub total_cents: u64,
}

impl EventPayload for OrderPlaced {
    const EVENT_TYPE: &'static str = "OrderPlaced";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderShipped {
    pub carrier: String,
}

impl EventPayload for OrderShipped {
    const EVENT_TYPE: &'static str = "OrderShipped";
}

pub fn registry() -> Arc<EventRegistry> {
    Arc::new(EventRegistry::new().with::<OrderPlaced>().with::<OrderShipped>())
}

pub struct Order {
    id: String,
    recorder: EventRecorder,
}

impl Order {
    pub fn place(id: &str, customer_id: &str, total_cents: u64) -> Self {
        let mut order = Self {
            id: id.to_string(),
            recorder: EventRecorder::new(),
        };
        order.recorder.raise(
            id,
            OrderPlaced {
                customer_id: customer_id.to_string(),
                total_cents,
            },
        );
        order
    }

    pub fn ship(&mut self, carrier: &str) {
        self.recorder.raise(
            &self.id,
            OrderShipped {
                carrier: carrier.to_string(),
            },
        );
    }
}

impl Aggregate for Order {
    fn aggregate_id(&self) -> &str {
        &self.id
    }

    fn aggregate_type(&self) -> &str {
        "Order"
    }

    fn pending_events(&self) -> &[Arc<dyn DomainEvent>] {
        self.recorder.events()
    }

    fn clear_events(&mut self) {
        self.recorder.clear();
    }
}

/// Forwards every event it handles to a channel.
pub struct ChannelHandler {
    name: String,
    tx: mpsc::UnboundedSender<Arc<dyn DomainEvent>>,
}

impl ChannelHandler {
    pub fn new(name: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<dyn DomainEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            name: name.to_string(),
            tx,
        });
        (handler, rx)
    }
}

#[async_trait]
impl EventHandler for ChannelHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: Arc<dyn DomainEvent>) -> Result<(), HandlerError> {
        self.tx.send(event)?;
        Ok(())
    }
}

/// Always fails.
pub struct BrokenHandler(pub &'static str);

#[async_trait]
impl EventHandler for BrokenHandler {
    fn name(&self) -> &str {
        self.0
    }

    async fn handle(&self, event: Arc<dyn DomainEvent>) -> Result<(), HandlerError> {
        Err(format!("cannot handle {}", event.event_id()).into())
    }
}
