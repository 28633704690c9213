//! Outbox publisher loop.
//!
//! Moves staged rows from the outbox to the broker. Sweeps are single-flight
//! per publisher: a timer tick that arrives while a sweep is running is a
//! no-op. A failed publish increments the row's attempts and the sweep moves
//! on; later rows of the same aggregate are skipped for that sweep so the
//! broker never sees an aggregate's events out of order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerAdapter;
use crate::clock::{saturating_sub, system_clock, Clock};
use crate::outbox::{OutboxConfig, OutboxEvent, OutboxStore, Result};

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
    /// Rows held back because an earlier row of their aggregate failed.
    pub skipped: usize,
    /// Another sweep was already running; nothing was done.
    pub busy: bool,
}

pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn BrokerAdapter>,
    config: OutboxConfig,
    clock: Arc<dyn Clock>,
    in_flight: Mutex<()>,
}

impl OutboxPublisher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn BrokerAdapter>,
        config: OutboxConfig,
    ) -> Self {
        Self::with_clock(store, broker, config, system_clock())
    }

    pub fn with_clock(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn BrokerAdapter>,
        config: OutboxConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            broker,
            config,
            clock,
            in_flight: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn OutboxStore> {
        &self.store
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Timer entry point. Skips if a sweep is already running.
    #[tracing::instrument(name = "publisher.tick", skip(self))]
    pub async fn tick(&self) -> Result<SweepReport> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Sweep already in flight, skipping tick");
            return Ok(SweepReport {
                busy: true,
                ..Default::default()
            });
        };
        self.sweep(self.config.batch_size).await
    }

    /// Manual drain of up to `limit` rows. Waits for a running sweep to finish.
    pub async fn publish_pending(&self, limit: usize) -> Result<SweepReport> {
        let _guard = self.in_flight.lock().await;
        self.sweep(limit).await
    }

    /// Re-attempt rows stuck at the attempt ceiling past the cooldown.
    pub async fn redrive_failed(&self) -> Result<SweepReport> {
        let _guard = self.in_flight.lock().await;
        let rows = self
            .store
            .find_failed_events(self.config.max_attempts, self.config.redrive_cooldown())
            .await?;
        if !rows.is_empty() {
            info!(count = rows.len(), "Redriving failed outbox rows");
        }
        Ok(self.publish_rows(rows).await)
    }

    /// Delete published rows older than the retention window.
    pub async fn sweep_retention(&self) -> Result<u64> {
        let cutoff = saturating_sub(self.clock.now(), self.config.retention());
        let deleted = self.store.delete_published_older_than(cutoff).await?;
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "Outbox retention sweep");
        }
        Ok(deleted)
    }

    async fn sweep(&self, limit: usize) -> Result<SweepReport> {
        let rows = self.store.find_unpublished(limit).await?;
        Ok(self.publish_rows(rows).await)
    }

    async fn publish_rows(&self, rows: Vec<OutboxEvent>) -> SweepReport {
        let mut report = SweepReport {
            fetched: rows.len(),
            ..Default::default()
        };
        let mut blocked: HashSet<String> = HashSet::new();

        for row in rows {
            if blocked.contains(&row.aggregate_id) {
                report.skipped += 1;
                continue;
            }

            match self.broker.publish(&row.to_envelope()).await {
                Ok(()) => {
                    report.published += 1;
                    if let Err(e) = self.store.mark_as_published(row.event_id).await {
                        // Row stays unpublished and is sent again next sweep.
                        error!(event_id = %row.event_id, error = %e, "Failed to mark outbox row published");
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    blocked.insert(row.aggregate_id.clone());
                    warn!(
                        event_id = %row.event_id,
                        event_type = %row.event_type,
                        attempts = row.attempts + 1,
                        error = %e,
                        "Outbox publish failed"
                    );
                    if let Err(e) = self.store.increment_attempts(row.event_id, &e.to_string()).await {
                        error!(event_id = %row.event_id, error = %e, "Failed to record publish attempt");
                    }
                }
            }
        }

        if report.fetched > 0 {
            debug!(
                fetched = report.fetched,
                published = report.published,
                failed = report.failed,
                skipped = report.skipped,
                "Outbox sweep finished"
            );
        }
        report
    }

    /// Run publish and retention sweeps on their intervals until stopped.
    pub fn spawn(self: Arc<Self>) -> PublisherHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let publish_every = Duration::from_secs(self.config.publish_interval_secs.max(1));
        let retain_every = Duration::from_secs(self.config.retention_interval_secs.max(1));

        let task = tokio::spawn(async move {
            let mut publish_ticker = tokio::time::interval(publish_every);
            publish_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut retention_ticker = tokio::time::interval(retain_every);
            retention_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                publish_interval_secs = publish_every.as_secs(),
                retention_interval_secs = retain_every.as_secs(),
                "Outbox publisher started"
            );

            loop {
                tokio::select! {
                    _ = publish_ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            error!(error = %e, "Outbox publish sweep failed");
                        }
                    }
                    _ = retention_ticker.tick() => {
                        if let Err(e) = self.sweep_retention().await {
                            error!(error = %e, "Outbox retention sweep failed");
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            info!("Outbox publisher stopped");
                            break;
                        }
                    }
                }
            }
        });

        PublisherHandle {
            stop: stop_tx,
            task,
        }
    }
}

/// Handle to a running publisher task.
pub struct PublisherHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PublisherHandle {
    /// Signal the task to stop after its current sweep.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Stop and wait for the task to exit.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            error!(error = %e, "Outbox publisher task panicked");
        }
    }
}

#[cfg(test)]
mod tests;
