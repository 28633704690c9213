//! Reliable handler execution.
//!
//! Wraps each handler invocation with observer notifications, an optional
//! circuit breaker, capped exponential-backoff retries, and dead-lettering
//! once retries are exhausted.
//!
//! First attempts run inline with the dispatch. Retries are work items on the
//! `RetryScheduler`, so they are cancellable and visible while waiting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::{HandlerOutcome, HandlerRegistry, HandlerResult, RegisteredHandler};
use crate::circuit::CircuitBreakerRegistry;
use crate::dlq::{DeadLetterQueue, FailedEvent};
use crate::event::DomainEvent;

mod policy;
mod scheduler;

pub use policy::RetryPolicy;
pub use scheduler::{RetryScheduler, ScheduledRetry};

// ============================================================================
// Observers
// ============================================================================

/// Identity of one handler execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_id: String,
    pub handler_name: String,
    /// 0 for the first attempt.
    pub retry_count: u32,
    pub max_retries: u32,
}

impl ExecutionContext {
    fn new(event: &dyn DomainEvent, registration: &RegisteredHandler, retry_count: u32) -> Self {
        Self {
            event_id: event.event_id(),
            event_type: event.event_type().to_string(),
            aggregate_id: event.aggregate_id().to_string(),
            handler_name: registration.name.clone(),
            retry_count,
            max_retries: registration.policy.max_retries,
        }
    }

    /// True when no retry remains after a failure of this execution.
    pub fn is_final_attempt(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Receives lifecycle notifications for every handler execution.
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    async fn on_started(&self, _ctx: &ExecutionContext) {}

    async fn on_completed(&self, _ctx: &ExecutionContext, _elapsed: Duration) {}

    async fn on_failed(&self, _ctx: &ExecutionContext, _error: &str, _elapsed: Duration) {}

    async fn on_retrying(&self, _ctx: &ExecutionContext, _delay: Duration) {}

    async fn on_dead_lettered(&self, _ctx: &ExecutionContext, _failed: &FailedEvent) {}
}

// ============================================================================
// Reprocessing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessFailure {
    pub id: Uuid,
    pub error: String,
}

/// Result of a manual dead-letter reprocessing run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessReport {
    pub attempted: usize,
    pub succeeded: Vec<Uuid>,
    pub failed: Vec<ReprocessFailure>,
    /// Requested ids with no quarantine entry.
    pub not_found: Vec<Uuid>,
}

// ============================================================================
// Executor
// ============================================================================

/// Retry, breaker, and dead-letter wrapper around handler invocation.
pub struct ReliabilityExecutor {
    handlers: HandlerRegistry,
    dead_letters: Arc<DeadLetterQueue>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    observers: Vec<Arc<dyn ExecutionObserver>>,
    scheduler: RetryScheduler,
}

impl ReliabilityExecutor {
    pub fn new(handlers: HandlerRegistry, dead_letters: Arc<DeadLetterQueue>) -> Self {
        Self {
            handlers,
            dead_letters,
            breakers: None,
            observers: Vec::new(),
            scheduler: RetryScheduler::new(),
        }
    }

    /// Breakers for handlers registered with a dependency name.
    pub fn with_circuit_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letters
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    /// Run every handler for `event`, settling all of them.
    ///
    /// One handler's failure never affects its siblings. Results are in
    /// registration order.
    pub async fn dispatch(
        self: &Arc<Self>,
        event: Arc<dyn DomainEvent>,
        handlers: Vec<RegisteredHandler>,
    ) -> Vec<HandlerResult> {
        let executions = handlers
            .into_iter()
            .map(|registration| Arc::clone(self).execute(Arc::clone(&event), registration, 0));
        futures::future::join_all(executions).await
    }

    /// One attempt plus the retry/dead-letter decision.
    fn execute(
        self: Arc<Self>,
        event: Arc<dyn DomainEvent>,
        registration: RegisteredHandler,
        retry_count: u32,
    ) -> BoxFuture<'static, HandlerResult> {
        Box::pin(async move {
            let ctx = ExecutionContext::new(event.as_ref(), &registration, retry_count);

            let outcome = match self.attempt(&event, &registration, &ctx).await {
                Ok(()) => HandlerOutcome::Succeeded,
                Err(_) if registration.policy.should_retry(retry_count) => {
                    self.schedule_retry(Arc::clone(&event), registration, &ctx)
                        .await
                }
                Err(error) => {
                    let failed = self
                        .dead_letters
                        .push(Arc::clone(&event), &ctx.handler_name, &error, retry_count)
                        .await;
                    error!(
                        event_id = %ctx.event_id,
                        event_type = %ctx.event_type,
                        handler = %ctx.handler_name,
                        retry_count,
                        error = %error,
                        "Handler retries exhausted"
                    );
                    for observer in &self.observers {
                        observer.on_dead_lettered(&ctx, &failed).await;
                    }
                    HandlerOutcome::DeadLettered {
                        failed_event_id: failed.id,
                    }
                }
            };

            HandlerResult {
                event_id: ctx.event_id,
                event_type: ctx.event_type,
                handler_name: ctx.handler_name,
                outcome,
            }
        })
    }

    async fn attempt(
        &self,
        event: &Arc<dyn DomainEvent>,
        registration: &RegisteredHandler,
        ctx: &ExecutionContext,
    ) -> Result<(), String> {
        for observer in &self.observers {
            observer.on_started(ctx).await;
        }

        let started = tokio::time::Instant::now();
        let result = match (&registration.circuit_breaker, &self.breakers) {
            (Some(dependency), Some(breakers)) => {
                let breaker = breakers.get(dependency).await;
                breaker
                    .execute(|| registration.handler.handle(Arc::clone(event)))
                    .await
                    .map_err(|e| e.to_string())
            }
            _ => registration
                .handler
                .handle(Arc::clone(event))
                .await
                .map_err(|e| e.to_string()),
        };
        let elapsed = started.elapsed();

        match &result {
            Ok(()) => {
                for observer in &self.observers {
                    observer.on_completed(ctx, elapsed).await;
                }
            }
            Err(e) => {
                for observer in &self.observers {
                    observer.on_failed(ctx, e, elapsed).await;
                }
            }
        }

        result
    }

    async fn schedule_retry(
        self: &Arc<Self>,
        event: Arc<dyn DomainEvent>,
        registration: RegisteredHandler,
        ctx: &ExecutionContext,
    ) -> HandlerOutcome {
        let delay = registration.policy.delay_for(ctx.retry_count);
        let next = ctx.retry_count + 1;

        warn!(
            event_id = %ctx.event_id,
            event_type = %ctx.event_type,
            handler = %ctx.handler_name,
            retry_count = next,
            delay_ms = delay.as_millis() as u64,
            "Handler failed, scheduling retry"
        );
        for observer in &self.observers {
            observer.on_retrying(ctx, delay).await;
        }

        let work = ScheduledRetry::new(ctx.event_id, &ctx.event_type, &ctx.handler_name, next, delay);
        let executor = Arc::clone(self);
        self.scheduler
            .schedule(work, delay, async move {
                executor.execute(event, registration, next).await;
            })
            .await;

        HandlerOutcome::RetryScheduled {
            retry_count: next,
            delay,
        }
    }

    /// Give quarantined events one more direct attempt.
    ///
    /// `ids` limits the run to those entries; `None` reprocesses everything.
    /// Successes leave the quarantine; failures stay with a bumped retry count.
    pub async fn reprocess_failed_events(&self, ids: Option<&[Uuid]>) -> ReprocessReport {
        let mut report = ReprocessReport::default();

        let candidates: Vec<FailedEvent> = match ids {
            Some(ids) => {
                let mut found = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.dead_letters.get(*id).await {
                        Some(failed) => found.push(failed),
                        None => report.not_found.push(*id),
                    }
                }
                found
            }
            None => self.dead_letters.list().await,
        };

        for failed in candidates {
            report.attempted += 1;

            let Some(registration) = self
                .handlers
                .find(&failed.event_type, &failed.handler_name)
                .await
            else {
                report.failed.push(ReprocessFailure {
                    id: failed.id,
                    error: format!(
                        "handler '{}' is not registered for '{}'",
                        failed.handler_name, failed.event_type
                    ),
                });
                continue;
            };

            let ctx = ExecutionContext::new(failed.event.as_ref(), &registration, failed.retry_count);
            match self.attempt(&failed.event, &registration, &ctx).await {
                Ok(()) => {
                    // Entry may have been cleared concurrently.
                    let _ = self.dead_letters.remove(failed.id).await;
                    report.succeeded.push(failed.id);
                }
                Err(error) => {
                    let _ = self.dead_letters.record_retry_failure(failed.id, &error).await;
                    report.failed.push(ReprocessFailure {
                        id: failed.id,
                        error,
                    });
                }
            }
        }

        info!(
            attempted = report.attempted,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Reprocessed failed events"
        );
        report
    }

    /// Retries waiting on the scheduler.
    pub async fn pending_retries(&self) -> Vec<ScheduledRetry> {
        self.scheduler.pending().await
    }

    /// Cancel waiting retries and stop scheduling new ones.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
