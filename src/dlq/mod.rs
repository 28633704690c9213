//! Dead-letter quarantine for handler executions that exhausted their retries.
//!
//! Entries are held in memory for inspection and manual reprocessing. Each
//! entry keeps the original event so reprocessing needs no decoding.
//!
//! Broker-level dead letters (malformed or undecodable messages) never land
//! here; they stay in the broker's DLQ queues.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{saturating_sub, system_clock, Clock};
use crate::event::DomainEvent;

/// Result type for quarantine operations.
pub type Result<T> = std::result::Result<T, DlqError>;

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Failed event not found: {0}")]
    NotFound(Uuid),
}

/// Quarantine record of one `(event, handler)` pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEvent {
    /// Quarantine entry id (not the event id).
    pub id: Uuid,
    pub event_id: Uuid,
    pub event_type: String,
    pub handler_name: String,
    pub aggregate_id: String,
    pub payload: Value,
    pub error: String,
    pub retry_count: u32,
    pub failed_at: DateTime<Utc>,
    #[serde(skip)]
    pub event: Arc<dyn DomainEvent>,
}

/// Counts and time span of one group of failed events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub key: String,
    pub count: usize,
    pub oldest: DateTime<Utc>,
    pub newest: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterSummary {
    pub total: usize,
    pub by_event_type: Vec<GroupSummary>,
    pub by_handler: Vec<GroupSummary>,
}

/// In-memory quarantine list.
pub struct DeadLetterQueue {
    entries: RwLock<Vec<FailedEvent>>,
    clock: Arc<dyn Clock>,
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            clock,
        }
    }

    /// Quarantine `event` for `handler_name` after its final failure.
    pub async fn push(
        &self,
        event: Arc<dyn DomainEvent>,
        handler_name: &str,
        error: &str,
        retry_count: u32,
    ) -> FailedEvent {
        let failed = FailedEvent {
            id: Uuid::new_v4(),
            event_id: event.event_id(),
            event_type: event.event_type().to_string(),
            handler_name: handler_name.to_string(),
            aggregate_id: event.aggregate_id().to_string(),
            payload: event.payload().unwrap_or(Value::Null),
            error: error.to_string(),
            retry_count,
            failed_at: self.clock.now(),
            event,
        };

        warn!(
            failed_event_id = %failed.id,
            event_id = %failed.event_id,
            event_type = %failed.event_type,
            handler = %failed.handler_name,
            retry_count,
            "Event moved to dead-letter quarantine"
        );

        self.entries.write().await.push(failed.clone());
        failed
    }

    /// All entries, oldest first.
    pub async fn list(&self) -> Vec<FailedEvent> {
        self.entries.read().await.clone()
    }

    pub async fn get(&self, id: Uuid) -> Option<FailedEvent> {
        self.entries.read().await.iter().find(|f| f.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn remove(&self, id: Uuid) -> Result<FailedEvent> {
        let mut entries = self.entries.write().await;
        let index = entries
            .iter()
            .position(|f| f.id == id)
            .ok_or(DlqError::NotFound(id))?;
        Ok(entries.remove(index))
    }

    /// Record another failed reprocessing attempt.
    pub async fn record_retry_failure(&self, id: Uuid, error: &str) -> Result<FailedEvent> {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or(DlqError::NotFound(id))?;

        entry.error = error.to_string();
        entry.retry_count += 1;
        entry.failed_at = now;
        Ok(entry.clone())
    }

    /// Drop entries, or only those that failed more than `older_than` ago.
    pub async fn clear(&self, older_than: Option<Duration>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        match older_than {
            Some(age) => {
                let cutoff = saturating_sub(self.clock.now(), age);
                entries.retain(|f| f.failed_at >= cutoff);
            }
            None => entries.clear(),
        }
        let removed = before - entries.len();

        if removed > 0 {
            info!(removed, "Cleared failed events");
        }
        removed
    }

    pub async fn summary(&self) -> DeadLetterSummary {
        let entries = self.entries.read().await;
        DeadLetterSummary {
            total: entries.len(),
            by_event_type: group_by(&entries, |f| &f.event_type),
            by_handler: group_by(&entries, |f| &f.handler_name),
        }
    }
}

fn group_by(entries: &[FailedEvent], key: impl Fn(&FailedEvent) -> &String) -> Vec<GroupSummary> {
    let mut groups: BTreeMap<String, GroupSummary> = BTreeMap::new();
    for entry in entries {
        groups
            .entry(key(entry).clone())
            .and_modify(|g| {
                g.count += 1;
                g.oldest = g.oldest.min(entry.failed_at);
                g.newest = g.newest.max(entry.failed_at);
            })
            .or_insert_with(|| GroupSummary {
                key: key(entry).clone(),
                count: 1,
                oldest: entry.failed_at,
                newest: entry.failed_at,
            });
    }
    groups.into_values().collect()
}
