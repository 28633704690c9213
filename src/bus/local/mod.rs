//! Local, in-process event bus.
//!
//! Aggregates are marked for dispatch after their state is saved and flushed
//! once the surrounding transaction commits. Dispatch runs either directly
//! (sequential, errors collected) or through the reliability executor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{
    DispatchReport, EventHandler, HandlerOutcome, HandlerRegistry, HandlerResult,
    RegisteredHandler,
};
use crate::aggregate::Aggregate;
use crate::event::DomainEvent;
use crate::reliability::ReliabilityExecutor;

/// Snapshot of an aggregate's events awaiting flush.
struct PendingAggregate {
    aggregate_id: String,
    events: Vec<Arc<dyn DomainEvent>>,
}

/// In-process dispatcher for aggregate events.
pub struct LocalEventBus {
    handlers: HandlerRegistry,
    pending: RwLock<Vec<PendingAggregate>>,
    dispatch_enabled: AtomicBool,
    executor: Option<Arc<ReliabilityExecutor>>,
}

impl LocalEventBus {
    /// Direct-mode bus over `handlers`.
    pub fn new(handlers: HandlerRegistry) -> Self {
        Self {
            handlers,
            pending: RwLock::new(Vec::new()),
            dispatch_enabled: AtomicBool::new(true),
            executor: None,
        }
    }

    /// Route dispatch through the reliability executor.
    pub fn with_executor(mut self, executor: Arc<ReliabilityExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Register `handler` for `event_type` with the default policy.
    pub async fn register(&self, handler: Arc<dyn EventHandler>, event_type: &str) {
        let registration =
            RegisteredHandler::new(handler).with_policy(self.handlers.default_policy().clone());
        self.handlers.register(event_type, registration).await;
    }

    /// Register a handler with an explicit policy or circuit breaker.
    pub async fn register_with(&self, event_type: &str, registration: RegisteredHandler) {
        self.handlers.register(event_type, registration).await;
    }

    /// Global kill switch. While disabled, flushes drop events without dispatch.
    pub fn set_dispatch_enabled(&self, enabled: bool) {
        self.dispatch_enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "Local event dispatch toggled");
    }

    pub fn is_dispatch_enabled(&self) -> bool {
        self.dispatch_enabled.load(Ordering::SeqCst)
    }

    /// Add an aggregate's current events to the pending set.
    ///
    /// Marking the same aggregate twice before a flush merges by event id,
    /// so events are never dispatched twice. Returns `true` if the aggregate
    /// was not already pending.
    pub async fn mark_for_dispatch(&self, aggregate: &dyn Aggregate) -> bool {
        let events = aggregate.pending_events();
        let mut pending = self.pending.write().await;

        if let Some(entry) = pending
            .iter_mut()
            .find(|p| p.aggregate_id == aggregate.aggregate_id())
        {
            for event in events {
                if !entry.events.iter().any(|e| e.event_id() == event.event_id()) {
                    entry.events.push(Arc::clone(event));
                }
            }
            return false;
        }

        pending.push(PendingAggregate {
            aggregate_id: aggregate.aggregate_id().to_string(),
            events: events.to_vec(),
        });
        true
    }

    pub async fn is_pending(&self, aggregate_id: &str) -> bool {
        self.pending
            .read()
            .await
            .iter()
            .any(|p| p.aggregate_id == aggregate_id)
    }

    /// Dispatch a pending aggregate's events and remove it from the pending set.
    ///
    /// Flushing an aggregate that is not pending dispatches nothing.
    pub async fn flush(&self, aggregate_id: &str) -> DispatchReport {
        let entry = {
            let mut pending = self.pending.write().await;
            match pending.iter().position(|p| p.aggregate_id == aggregate_id) {
                Some(index) => pending.remove(index),
                None => return DispatchReport::default(),
            }
        };

        if !self.is_dispatch_enabled() {
            debug!(
                aggregate_id = %aggregate_id,
                dropped = entry.events.len(),
                "Dispatch disabled, dropping pending events"
            );
            return DispatchReport::default();
        }

        let mut report = DispatchReport::default();
        for event in entry.events {
            report.extend(self.dispatch_event(event).await);
        }
        report
    }

    /// Mark, flush, and clear an aggregate in one step.
    pub async fn dispatch_aggregate(&self, aggregate: &mut dyn Aggregate) -> DispatchReport {
        self.mark_for_dispatch(aggregate).await;
        let report = self.flush(aggregate.aggregate_id()).await;
        aggregate.clear_events();
        report
    }

    /// Dispatch a single event, bypassing the pending set.
    ///
    /// Used by the broker consumer to re-dispatch decoded events.
    pub async fn dispatch(&self, event: Arc<dyn DomainEvent>) -> DispatchReport {
        if !self.is_dispatch_enabled() {
            debug!(
                event_id = %event.event_id(),
                event_type = %event.event_type(),
                "Dispatch disabled, dropping event"
            );
            return DispatchReport::default();
        }

        let mut report = DispatchReport::default();
        report.extend(self.dispatch_event(event).await);
        report
    }

    async fn dispatch_event(&self, event: Arc<dyn DomainEvent>) -> Vec<HandlerResult> {
        let handlers = self.handlers.handlers_for(event.event_type()).await;
        if handlers.is_empty() {
            debug!(
                event_type = %event.event_type(),
                "No handlers registered for event type"
            );
            return Vec::new();
        }

        match &self.executor {
            Some(executor) => executor.dispatch(event, handlers).await,
            None => dispatch_direct(event, handlers).await,
        }
    }
}

/// Invoke handlers one at a time in registration order.
///
/// A failing handler is logged and recorded; later handlers still run.
async fn dispatch_direct(
    event: Arc<dyn DomainEvent>,
    handlers: Vec<RegisteredHandler>,
) -> Vec<HandlerResult> {
    let event_id: Uuid = event.event_id();
    let mut results = Vec::with_capacity(handlers.len());

    for registration in handlers {
        let outcome = match registration.handler.handle(Arc::clone(&event)).await {
            Ok(()) => HandlerOutcome::Succeeded,
            Err(e) => {
                error!(
                    event_id = %event_id,
                    event_type = %event.event_type(),
                    handler = %registration.name,
                    error = %e,
                    "Event handler failed"
                );
                HandlerOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        results.push(HandlerResult {
            event_id,
            event_type: event.event_type().to_string(),
            handler_name: registration.name,
            outcome,
        });
    }

    results
}
