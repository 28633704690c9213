//! Aggregate abstraction consumed by the event pipeline.
//!
//! Business aggregates record events while handling use cases; the owning
//! repository hands them to the outbox and the local bus after persisting.

use std::sync::Arc;

use crate::event::{DomainEvent, Event, EventPayload};

/// A business entity that accumulates pending domain events until flushed.
pub trait Aggregate: Send + Sync {
    /// Identifier shared by every event this aggregate raises.
    fn aggregate_id(&self) -> &str;

    /// Aggregate kind, carried on the wire as `aggregateType`.
    fn aggregate_type(&self) -> &str;

    /// Events raised since the last flush, in raise order.
    fn pending_events(&self) -> &[Arc<dyn DomainEvent>];

    /// Drop pending events after they have been handed off.
    fn clear_events(&mut self);
}

/// Pending-event list to embed in an aggregate.
#[derive(Debug, Default, Clone)]
pub struct EventRecorder {
    events: Vec<Arc<dyn DomainEvent>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise a typed event for `aggregate_id`.
    pub fn raise<P: EventPayload>(&mut self, aggregate_id: &str, data: P) -> Arc<dyn DomainEvent> {
        let event: Arc<dyn DomainEvent> = Arc::new(Event::new(aggregate_id, data));
        self.events.push(Arc::clone(&event));
        event
    }

    /// Record an already-built event.
    pub fn record(&mut self, event: Arc<dyn DomainEvent>) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[Arc<dyn DomainEvent>] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
