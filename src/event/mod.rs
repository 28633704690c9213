//! Domain events, the wire envelope, and the event-type registry.
//!
//! This module contains:
//! - `EventPayload`: schema-versioned, typed payload of one event type
//! - `DomainEvent`: object-safe view of any raised event
//! - `Event<P>`: the concrete event value aggregates record
//! - `EventEnvelope`: transport-level representation sent through the outbox and broker
//! - `EventRegistry`: maps type names to decoders for deserialization

use std::any::Any;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

mod envelope;
mod registry;

pub use envelope::EventEnvelope;
pub use registry::EventRegistry;

/// Result type for event operations.
pub type Result<T> = std::result::Result<T, EventError>;

/// Errors raised while encoding or decoding events.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Unknown event type: {0}")]
    UnknownType(String),

    #[error("Event '{event_type}' has schema version {version}, registry supports up to {supported}")]
    UnsupportedVersion {
        event_type: String,
        version: u32,
        supported: u32,
    },

    #[error("Invalid payload for '{event_type}': {reason}")]
    InvalidPayload { event_type: String, reason: String },

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Typed payload of one event type.
///
/// The type name and schema version are part of the type, so every payload
/// carries its own wire identity.
pub trait EventPayload: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    /// Wire name of the event type.
    const EVENT_TYPE: &'static str;

    /// Schema version. Bump when the payload shape changes.
    const VERSION: u32 = 1;

    /// Semantic validation applied after deserialization.
    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// An immutable business event raised by an aggregate.
pub trait DomainEvent: fmt::Debug + Send + Sync + 'static {
    /// Globally unique id, used as the idempotency key downstream.
    fn event_id(&self) -> Uuid;

    fn event_type(&self) -> &str;

    fn event_version(&self) -> u32;

    fn aggregate_id(&self) -> &str;

    fn occurred_at(&self) -> DateTime<Utc>;

    /// Structured snapshot of the event's fields.
    fn payload(&self) -> Result<Value>;

    fn as_any(&self) -> &dyn Any;
}

impl dyn DomainEvent {
    /// Downcast to the concrete typed event.
    pub fn downcast_ref<P: EventPayload>(&self) -> Option<&Event<P>> {
        self.as_any().downcast_ref::<Event<P>>()
    }
}

/// Concrete domain event wrapping a typed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<P> {
    event_id: Uuid,
    aggregate_id: String,
    occurred_at: DateTime<Utc>,
    data: P,
    /// Payload fields not known to `P`, kept so re-publication does not drop them.
    extra: Map<String, Value>,
}

impl<P: EventPayload> Event<P> {
    /// Raise a new event for an aggregate, stamped now.
    pub fn new(aggregate_id: impl Into<String>, data: P) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id: aggregate_id.into(),
            occurred_at: Utc::now(),
            data,
            extra: Map::new(),
        }
    }

    /// Override the occurrence timestamp.
    pub fn occurred(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = at;
        self
    }

    /// Override the event id.
    pub fn with_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn data(&self) -> &P {
        &self.data
    }

    /// Fields present on the wire that `P` does not model.
    pub fn extra_fields(&self) -> &Map<String, Value> {
        &self.extra
    }

    pub(crate) fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = extra;
        self
    }
}

impl<P: EventPayload> DomainEvent for Event<P> {
    fn event_id(&self) -> Uuid {
        self.event_id
    }

    fn event_type(&self) -> &str {
        P::EVENT_TYPE
    }

    fn event_version(&self) -> u32 {
        P::VERSION
    }

    fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    fn payload(&self) -> Result<Value> {
        let mut value = serde_json::to_value(&self.data)?;
        if let Value::Object(fields) = &mut value {
            for (key, extra) in &self.extra {
                fields.entry(key.clone()).or_insert_with(|| extra.clone());
            }
        }
        Ok(value)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
