//! Broker adapters.
//!
//! A broker owns the wire topology: one topic exchange for events, one
//! dead-letter exchange, and per event type a durable queue with its own
//! dead-letter queue. Publishing is persistent and confirmed; consuming acks
//! only after the handler succeeds and nacks without requeue otherwise, so
//! the broker's dead-letter policy takes over.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bus::HandlerError;
use crate::event::{EventEnvelope, EventError};

#[cfg(feature = "amqp")]
pub mod amqp;
mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::{DeadLetteredMessage, InMemoryBroker};

/// Default prefix for exchange and queue names.
pub const DEFAULT_PREFIX: &str = "courier";

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Broker rejected message {0}")]
    Rejected(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Broker not connected")]
    NotConnected,

    #[error("Topology declaration failed: {0}")]
    Topology(String),

    #[error(transparent)]
    Envelope(#[from] EventError),
}

/// A message as received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    pub message_type: Option<String>,
    pub routing_key: String,
    pub redelivered: bool,
}

/// Consumer callback attached to one event type's queue.
///
/// `Ok` acks the message; `Err` nacks it without requeue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: IncomingMessage) -> std::result::Result<(), HandlerError>;
}

/// Transport that moves envelopes between processes.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Open the connection and declare the shared exchanges.
    async fn connect(&self) -> Result<()>;

    /// Publish persistently. Fails if the broker does not confirm the write.
    async fn publish(&self, envelope: &EventEnvelope) -> Result<()>;

    /// Attach a consumer to `event_type`'s queue, declaring it if needed.
    async fn subscribe(&self, event_type: &str, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Stop consumers and tear down the connection.
    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

// ============================================================================
// Topology
// ============================================================================

/// Exchange, queue and routing key names derived from one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    prefix: String,
}

impl Topology {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn exchange(&self) -> String {
        format!("{}.events", self.prefix)
    }

    pub fn dead_letter_exchange(&self) -> String {
        format!("{}.events.dlx", self.prefix)
    }

    pub fn queue(&self, event_type: &str) -> String {
        format!("{}.{}", self.prefix, event_type)
    }

    pub fn routing_key(&self, event_type: &str) -> String {
        event_type.to_string()
    }

    pub fn dead_letter_queue(&self, event_type: &str) -> String {
        format!("{}.{}.dlq", self.prefix, event_type)
    }

    pub fn dead_letter_routing_key(&self, event_type: &str) -> String {
        format!("{}.dlq", event_type)
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// RabbitMQ queue flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    #[default]
    Quorum,
    Classic,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Quorum => "quorum",
            QueueType::Classic => "classic",
        }
    }
}

/// AMQP connection and topology settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Prefix for exchange and queue names.
    pub exchange_prefix: String,
    /// Queue message TTL in milliseconds.
    pub message_ttl_ms: u64,
    /// Deliveries before a quorum queue dead-letters a message.
    pub max_delivery_attempts: u32,
    pub queue_type: QueueType,
    /// Unacked messages per consumer channel.
    pub prefetch: u16,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            exchange_prefix: DEFAULT_PREFIX.to_string(),
            message_ttl_ms: 86_400_000,
            max_delivery_attempts: 3,
            queue_type: QueueType::Quorum,
            prefetch: 32,
        }
    }
}

impl AmqpConfig {
    pub fn topology(&self) -> Topology {
        Topology::new(&self.exchange_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_names() {
        let topology = Topology::new("forum");
        assert_eq!(topology.exchange(), "forum.events");
        assert_eq!(topology.dead_letter_exchange(), "forum.events.dlx");
        assert_eq!(topology.queue("QuestionCreated"), "forum.QuestionCreated");
        assert_eq!(topology.routing_key("QuestionCreated"), "QuestionCreated");
        assert_eq!(
            topology.dead_letter_queue("QuestionCreated"),
            "forum.QuestionCreated.dlq"
        );
        assert_eq!(
            topology.dead_letter_routing_key("QuestionCreated"),
            "QuestionCreated.dlq"
        );
    }

    #[test]
    fn test_amqp_config_defaults() {
        let config = AmqpConfig::default();
        assert_eq!(config.topology(), Topology::default());
        assert_eq!(config.message_ttl_ms, 86_400_000);
        assert_eq!(config.queue_type.as_str(), "quorum");
        assert_eq!(config.prefetch, 32);
    }

    #[test]
    fn test_queue_type_deserializes_lowercase() {
        let config: AmqpConfig =
            serde_json::from_value(serde_json::json!({ "queue_type": "classic" })).unwrap();
        assert_eq!(config.queue_type, QueueType::Classic);
        assert_eq!(config.max_delivery_attempts, 3);
    }
}
