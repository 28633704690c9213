//! Delay queue for handler retries.
//!
//! Each retry is a tracked task that sleeps for its delay and then runs its
//! work, unless cancelled first. Shutdown cancels everything still waiting.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A retry waiting for its delay to elapse.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledRetry {
    pub id: Uuid,
    pub event_id: Uuid,
    pub event_type: String,
    pub handler_name: String,
    /// Retry number this work item will run as.
    pub retry_count: u32,
    pub delay_ms: u64,
    pub due_at: DateTime<Utc>,
}

impl ScheduledRetry {
    pub fn new(
        event_id: Uuid,
        event_type: &str,
        handler_name: &str,
        retry_count: u32,
        delay: Duration,
    ) -> Self {
        let due_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            id: Uuid::new_v4(),
            event_id,
            event_type: event_type.to_string(),
            handler_name: handler_name.to_string(),
            retry_count,
            delay_ms: delay.as_millis() as u64,
            due_at,
        }
    }
}

struct PendingRetry {
    retry: ScheduledRetry,
    cancel: CancellationToken,
}

/// Cancellable, observable delay queue.
pub struct RetryScheduler {
    shutdown: CancellationToken,
    tracker: TaskTracker,
    pending: Arc<Mutex<HashMap<Uuid, PendingRetry>>>,
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `work` after `delay`. Returns `None` once the scheduler is shut down.
    pub async fn schedule<F>(&self, retry: ScheduledRetry, delay: Duration, work: F) -> Option<Uuid>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            warn!(
                event_id = %retry.event_id,
                handler = %retry.handler_name,
                "Retry scheduler is shut down, dropping retry"
            );
            return None;
        }

        let id = retry.id;
        let cancel = self.shutdown.child_token();
        self.pending.lock().await.insert(
            id,
            PendingRetry {
                retry,
                cancel: cancel.clone(),
            },
        );

        let pending = Arc::clone(&self.pending);
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    pending.lock().await.remove(&id);
                    debug!(retry_id = %id, "Scheduled retry cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    pending.lock().await.remove(&id);
                    work.await;
                }
            }
        });

        Some(id)
    }

    /// Retries still waiting, soonest first.
    pub async fn pending(&self) -> Vec<ScheduledRetry> {
        let mut retries: Vec<ScheduledRetry> = self
            .pending
            .lock()
            .await
            .values()
            .map(|p| p.retry.clone())
            .collect();
        retries.sort_by_key(|r| r.due_at);
        retries
    }

    /// Cancel one waiting retry. Returns `false` if it already ran or is unknown.
    pub async fn cancel(&self, id: Uuid) -> bool {
        match self.pending.lock().await.get(&id) {
            Some(pending) => {
                pending.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel all waiting retries and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        info!("Retry scheduler shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until no retry is waiting or running, including retries that
    /// schedule further retries.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        if !self.shutdown.is_cancelled() {
            self.tracker.reopen();
        }
    }
}
