//! In-memory outbox store.
//!
//! No transactions: staging is atomic per `save_many` call only. Suited to
//! tests and single-process setups where losing staged rows on crash is fine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{OutboxError, OutboxEvent, OutboxStats, OutboxStore, Result};
use crate::clock::{saturating_sub, system_clock, Clock};

pub struct InMemoryOutboxStore {
    rows: RwLock<Vec<OutboxEvent>>,
    max_attempts: u32,
    clock: Arc<dyn Clock>,
    fail_on_save: AtomicBool,
}

impl InMemoryOutboxStore {
    pub fn new(max_attempts: u32) -> Self {
        Self::with_clock(max_attempts, system_clock())
    }

    pub fn with_clock(max_attempts: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            max_attempts,
            clock,
            fail_on_save: AtomicBool::new(false),
        }
    }

    /// Make subsequent `save_many` calls fail, to exercise staging failures.
    pub fn set_fail_on_save(&self, fail: bool) {
        self.fail_on_save.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<OutboxEvent> {
        self.rows.read().await.clone()
    }
}

fn sorted_by_occurrence(mut rows: Vec<OutboxEvent>) -> Vec<OutboxEvent> {
    rows.sort_by_key(|r| r.occurred_at);
    rows
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn save_many(&self, events: &[OutboxEvent]) -> Result<usize> {
        if self.fail_on_save.load(Ordering::SeqCst) {
            return Err(OutboxError::Unavailable("in-memory store set to fail".to_string()));
        }

        let mut rows = self.rows.write().await;
        let mut inserted = 0;
        for event in events {
            if rows.iter().any(|r| r.event_id == event.event_id) {
                debug!(event_id = %event.event_id, "Duplicate outbox row ignored");
                continue;
            }
            rows.push(event.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn find_unpublished(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let rows = self.rows.read().await;
        let eligible = rows
            .iter()
            .filter(|r| !r.published && r.attempts < self.max_attempts)
            .cloned()
            .collect();
        Ok(sorted_by_occurrence(eligible).into_iter().take(limit).collect())
    }

    async fn find_failed_events(
        &self,
        max_attempts: u32,
        cooldown: chrono::Duration,
    ) -> Result<Vec<OutboxEvent>> {
        let cutoff = saturating_sub(self.clock.now(), cooldown);
        let rows = self.rows.read().await;
        let failed = rows
            .iter()
            .filter(|r| {
                !r.published
                    && r.attempts >= max_attempts
                    && r.last_attempt_at.map_or(true, |at| at < cutoff)
            })
            .cloned()
            .collect();
        Ok(sorted_by_occurrence(failed))
    }

    async fn mark_as_published(&self, event_id: Uuid) -> Result<()> {
        let now = self.clock.now();
        let mut rows = self.rows.write().await;
        let row = rows
            .iter_mut()
            .find(|r| r.event_id == event_id)
            .ok_or(OutboxError::NotFound(event_id))?;

        row.published = true;
        row.processed_at.get_or_insert(now);
        Ok(())
    }

    async fn increment_attempts(&self, event_id: Uuid, error: &str) -> Result<()> {
        let now = self.clock.now();
        let mut rows = self.rows.write().await;
        let row = rows
            .iter_mut()
            .find(|r| r.event_id == event_id)
            .ok_or(OutboxError::NotFound(event_id))?;

        row.attempts += 1;
        row.last_attempt_at = Some(now);
        row.error_message = Some(error.to_string());
        Ok(())
    }

    async fn delete_published_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|r| !(r.published && r.processed_at.is_some_and(|at| at < cutoff)));
        Ok((before - rows.len()) as u64)
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<OutboxEvent>> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .find(|r| r.event_id == event_id)
            .cloned())
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let rows = self.rows.read().await;
        let mut stats = OutboxStats::default();
        for row in rows.iter() {
            if row.published {
                stats.published += 1;
            } else if row.attempts >= self.max_attempts {
                stats.failed += 1;
            } else {
                stats.pending += 1;
                stats.oldest_pending_at = Some(match stats.oldest_pending_at {
                    Some(oldest) => oldest.min(row.occurred_at),
                    None => row.occurred_at,
                });
            }
        }
        Ok(stats)
    }
}
