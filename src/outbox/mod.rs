//! Transactional outbox.
//!
//! Events are written to the outbox in the same transaction that saves the
//! aggregate that raised them, then relayed to the broker by the publisher.
//! A row is never lost between "entity saved" and "event published":
//!
//! 1. Repository saves the entity and stages its events (one transaction)
//! 2. Transaction commits; events are dispatched to local handlers
//! 3. `OutboxPublisher` publishes unpublished rows and marks them published
//!
//! A failed publish only increments `attempts`; the row stays for the next
//! sweep until it reaches `max_attempts`, after which it waits for redrive.
//!
//! # Configuration
//!
//! ```yaml
//! outbox:
//!   enabled: true
//!   max_attempts: 5
//!   batch_size: 100
//!   publish_interval_secs: 10
//! ```
//!
//! Or via environment: `COURIER_OUTBOX_ENABLED=true`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::clock;
use crate::event::{EventEnvelope, EventError};

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;
mod staging;

pub use memory::InMemoryOutboxStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteOutboxStore;
pub use staging::OutboxStager;

/// Environment variable that force-enables outbox staging.
pub const OUTBOX_ENABLED_ENV_VAR: &str = "COURIER_OUTBOX_ENABLED";

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Outbox event not found: {0}")]
    NotFound(Uuid),

    #[error("Corrupt outbox row {event_id}: {reason}")]
    CorruptRow { event_id: String, reason: String },

    #[error("Outbox store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Event(#[from] EventError),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for OutboxError {
    fn from(e: sqlx::Error) -> Self {
        OutboxError::Database(e.to_string())
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Stage events in the outbox. Default: false.
    /// Can be overridden via COURIER_OUTBOX_ENABLED env var.
    pub enabled: bool,
    /// Publish attempts before a row waits for redrive. Default: 5.
    pub max_attempts: u32,
    /// Rows fetched per publisher tick. Default: 100.
    pub batch_size: usize,
    /// Interval between publisher ticks. Default: 10.
    pub publish_interval_secs: u64,
    /// Published rows older than this are deleted. Default: 7.
    pub retention_days: u32,
    /// Interval between retention sweeps. Default: 3600.
    pub retention_interval_secs: u64,
    /// Minimum age of the last attempt before a failed row is redriven. Default: 300.
    pub redrive_cooldown_secs: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: env_enabled(),
            max_attempts: 5,
            batch_size: 100,
            publish_interval_secs: 10,
            retention_days: 7,
            retention_interval_secs: 3600,
            redrive_cooldown_secs: 300,
        }
    }
}

impl OutboxConfig {
    /// Check if the outbox is enabled (config or env var).
    pub fn is_enabled(&self) -> bool {
        self.enabled || env_enabled()
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::try_days(i64::from(self.retention_days)).unwrap_or(chrono::Duration::MAX)
    }

    pub fn redrive_cooldown(&self) -> chrono::Duration {
        clock::seconds(self.redrive_cooldown_secs)
    }
}

fn env_enabled() -> bool {
    std::env::var(OUTBOX_ENABLED_ENV_VAR)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

// ============================================================================
// Rows
// ============================================================================

/// One staged event.
///
/// `published == true` implies `processed_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub payload: Value,
    pub published: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl OutboxEvent {
    /// Fresh, unpublished row for an envelope.
    pub fn from_envelope(envelope: EventEnvelope) -> Self {
        Self {
            event_id: envelope.event_id,
            event_type: envelope.event_type,
            aggregate_id: envelope.aggregate_id,
            aggregate_type: envelope.aggregate_type,
            event_version: envelope.event_version,
            occurred_at: envelope.occurred_at,
            payload: envelope.payload,
            published: false,
            processed_at: None,
            attempts: 0,
            last_attempt_at: None,
            error_message: None,
        }
    }

    /// Rows for every pending event of `aggregate`, in raise order.
    pub fn from_aggregate(aggregate: &dyn Aggregate) -> Result<Vec<Self>> {
        aggregate
            .pending_events()
            .iter()
            .map(|event| -> Result<Self> {
                let envelope = EventEnvelope::from_event(event.as_ref(), aggregate.aggregate_type())?;
                Ok(Self::from_envelope(envelope))
            })
            .collect()
    }

    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            event_version: self.event_version,
            occurred_at: self.occurred_at,
            payload: self.payload.clone(),
        }
    }
}

/// Row counts by delivery state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxStats {
    /// Unpublished and still eligible for publishing.
    pub pending: u64,
    pub published: u64,
    /// Unpublished and at the attempt ceiling.
    pub failed: u64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Store
// ============================================================================

/// Durable staging area for events awaiting publication.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist staged rows. Rows whose `event_id` already exists are ignored.
    /// Returns the number of rows inserted.
    async fn save_many(&self, events: &[OutboxEvent]) -> Result<usize>;

    /// Unpublished rows below the attempt ceiling, oldest `occurred_at` first.
    async fn find_unpublished(&self, limit: usize) -> Result<Vec<OutboxEvent>>;

    /// Unpublished rows at or above `max_attempts` whose last attempt is
    /// older than `cooldown`, oldest `occurred_at` first.
    async fn find_failed_events(
        &self,
        max_attempts: u32,
        cooldown: chrono::Duration,
    ) -> Result<Vec<OutboxEvent>>;

    /// Mark a row published. Repeated calls keep the first `processed_at`.
    async fn mark_as_published(&self, event_id: Uuid) -> Result<()>;

    /// Record a failed publish attempt.
    async fn increment_attempts(&self, event_id: Uuid, error: &str) -> Result<()>;

    /// Delete published rows processed before `cutoff`.
    async fn delete_published_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn get(&self, event_id: Uuid) -> Result<Option<OutboxEvent>>;

    async fn stats(&self) -> Result<OutboxStats>;
}
