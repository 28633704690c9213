//! Event-type registry.
//!
//! Built once during wiring and then shared read-only. Decoding validates the
//! envelope against the registered schema version and the payload type.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::{DomainEvent, Event, EventEnvelope, EventError, EventPayload, Result};

type Decoder = Arc<dyn Fn(&EventEnvelope) -> Result<Arc<dyn DomainEvent>> + Send + Sync>;

#[derive(Clone)]
struct RegistryEntry {
    version: u32,
    decoder: Decoder,
}

/// Maps event type names to decoders.
#[derive(Clone, Default)]
pub struct EventRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload type under its `EVENT_TYPE`.
    pub fn register<P: EventPayload>(&mut self) -> &mut Self {
        let decoder: Decoder = Arc::new(|envelope: &EventEnvelope| decode_typed::<P>(envelope));
        self.entries.insert(
            P::EVENT_TYPE.to_string(),
            RegistryEntry {
                version: P::VERSION,
                decoder,
            },
        );
        self
    }

    /// Builder-style variant of `register`.
    pub fn with<P: EventPayload>(mut self) -> Self {
        self.register::<P>();
        self
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.entries.contains_key(event_type)
    }

    /// Registered type names, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.entries.keys().cloned().collect();
        types.sort();
        types
    }

    /// Rebuild a domain event from its envelope.
    pub fn decode(&self, envelope: &EventEnvelope) -> Result<Arc<dyn DomainEvent>> {
        let entry = self
            .entries
            .get(&envelope.event_type)
            .ok_or_else(|| EventError::UnknownType(envelope.event_type.clone()))?;

        if envelope.event_version > entry.version {
            return Err(EventError::UnsupportedVersion {
                event_type: envelope.event_type.clone(),
                version: envelope.event_version,
                supported: entry.version,
            });
        }

        (entry.decoder)(envelope)
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}

fn decode_typed<P: EventPayload>(envelope: &EventEnvelope) -> Result<Arc<dyn DomainEvent>> {
    let invalid = |reason: String| EventError::InvalidPayload {
        event_type: envelope.event_type.clone(),
        reason,
    };

    let Value::Object(fields) = &envelope.payload else {
        return Err(invalid("payload is not an object".to_string()));
    };

    let data: P = serde_json::from_value(envelope.payload.clone())
        .map_err(|e| invalid(e.to_string()))?;
    data.validate().map_err(invalid)?;

    // Whatever P re-serializes is "known"; the rest rides along untouched.
    let known = match serde_json::to_value(&data)? {
        Value::Object(known) => known,
        _ => Map::new(),
    };
    let extra: Map<String, Value> = fields
        .iter()
        .filter(|(key, _)| !known.contains_key(*key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let event = Event::new(envelope.aggregate_id.clone(), data)
        .with_id(envelope.event_id)
        .occurred(envelope.occurred_at)
        .with_extra(extra);

    Ok(Arc::new(event))
}
