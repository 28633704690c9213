//! Staging an aggregate's events next to the entity write.

use std::sync::Arc;

#[cfg(feature = "sqlite")]
use sqlx::SqliteConnection;
use tracing::debug;

use super::{OutboxEvent, OutboxStore, Result};
use crate::aggregate::Aggregate;
use crate::bus::{DispatchReport, LocalEventBus};

/// Hands a persisted aggregate's events to the outbox and the local bus.
///
/// Repositories call [`stage`](Self::stage) inside their save transaction,
/// then [`dispatch`](Self::dispatch) once the transaction has committed.
pub struct OutboxStager {
    bus: Arc<LocalEventBus>,
    enabled: bool,
}

impl OutboxStager {
    pub fn new(bus: Arc<LocalEventBus>, enabled: bool) -> Self {
        Self { bus, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Stage pending events on the caller's open transaction.
    ///
    /// An error must abort that transaction: the entity is never committed
    /// without its events.
    #[cfg(feature = "sqlite")]
    pub async fn stage(&self, conn: &mut SqliteConnection, aggregate: &dyn Aggregate) -> Result<usize> {
        if !self.enabled || aggregate.pending_events().is_empty() {
            return Ok(0);
        }

        let rows = OutboxEvent::from_aggregate(aggregate)?;
        let inserted = super::SqliteOutboxStore::insert_rows(conn, &rows).await?;
        debug!(
            aggregate_id = %aggregate.aggregate_id(),
            staged = rows.len(),
            inserted,
            "Events staged in outbox"
        );
        Ok(inserted)
    }

    /// Stage pending events through a store without a shared transaction.
    pub async fn stage_into(&self, store: &dyn OutboxStore, aggregate: &dyn Aggregate) -> Result<usize> {
        if !self.enabled || aggregate.pending_events().is_empty() {
            return Ok(0);
        }

        let rows = OutboxEvent::from_aggregate(aggregate)?;
        let inserted = store.save_many(&rows).await?;
        debug!(
            aggregate_id = %aggregate.aggregate_id(),
            staged = rows.len(),
            inserted,
            "Events staged in outbox"
        );
        Ok(inserted)
    }

    /// Dispatch committed events locally and clear them from the aggregate.
    pub async fn dispatch(&self, aggregate: &mut dyn Aggregate) -> DispatchReport {
        self.bus.dispatch_aggregate(aggregate).await
    }
}
