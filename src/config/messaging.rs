//! Messaging backend selection.

use serde::Deserialize;

use crate::broker::AmqpConfig;

/// Messaging type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process broker double. Nothing leaves the process.
    #[default]
    Memory,
    /// AMQP/RabbitMQ broker.
    Amqp,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP-specific configuration.
    pub amqp: AmqpConfig,
}
