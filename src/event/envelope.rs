//! Wire envelope for events crossing the outbox and the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{DomainEvent, EventError, Result};

fn default_version() -> u32 {
    1
}

/// Serialized, transport-level representation of a domain event.
///
/// Broker message body is this struct as JSON; `event_id` doubles as the
/// broker message id and the consumer-side idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    #[serde(default = "default_version")]
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: Value,
}

impl EventEnvelope {
    /// Snapshot a raised event into an envelope.
    pub fn from_event(event: &dyn DomainEvent, aggregate_type: &str) -> Result<Self> {
        Ok(Self {
            event_id: event.event_id(),
            event_type: event.event_type().to_string(),
            aggregate_id: event.aggregate_id().to_string(),
            aggregate_type: aggregate_type.to_string(),
            event_version: event.event_version(),
            occurred_at: event.occurred_at(),
            payload: event.payload()?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a broker message body.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| EventError::MalformedEnvelope(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::test_utils::QuestionCreated;

    #[test]
    fn test_envelope_uses_camel_case_keys() {
        let event = Event::new("q-7", QuestionCreated::new("Lifetimes"));
        let envelope = EventEnvelope::from_event(&event, "Question").unwrap();

        let json: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(json["eventType"], "QuestionCreated");
        assert_eq!(json["aggregateId"], "q-7");
        assert_eq!(json["aggregateType"], "Question");
        assert_eq!(json["eventVersion"], 1);
        assert_eq!(json["payload"]["title"], "Lifetimes");
        assert_eq!(json["eventId"], event.event_id().to_string());
    }

    #[test]
    fn test_missing_version_defaults_to_one() {
        let body = serde_json::json!({
            "eventId": Uuid::new_v4(),
            "eventType": "QuestionCreated",
            "aggregateId": "q-1",
            "aggregateType": "Question",
            "occurredAt": Utc::now(),
            "payload": {"title": "t", "author_id": "u-1"}
        });

        let envelope = EventEnvelope::from_bytes(body.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.event_version, 1);
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = EventEnvelope::from_bytes(b"not json").unwrap_err();
        assert!(matches!(err, EventError::MalformedEnvelope(_)));
    }
}
