//! In-process event dispatch.
//!
//! This module contains:
//! - `EventHandler` trait: in-process consumer of domain events
//! - `HandlerRegistry`: explicit, shared per-type handler table
//! - `DispatchReport`: per-handler result collection of one dispatch
//! - `LocalEventBus`: pending-aggregate set and synchronous flush

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::event::DomainEvent;
use crate::reliability::RetryPolicy;

mod local;

pub use local::LocalEventBus;

/// Error type handlers return. Boxed so handlers can surface any failure.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// In-process consumer of domain events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name, used for metrics, dead letters and reprocessing.
    fn name(&self) -> &str;

    async fn handle(&self, event: Arc<dyn DomainEvent>) -> Result<(), HandlerError>;
}

/// A handler bound to one event type, with its delivery policy.
#[derive(Clone)]
pub struct RegisteredHandler {
    pub name: String,
    pub handler: Arc<dyn EventHandler>,
    pub policy: RetryPolicy,
    /// Circuit breaker guarding the handler's downstream dependency.
    pub circuit_breaker: Option<String>,
}

impl RegisteredHandler {
    pub fn new(handler: Arc<dyn EventHandler>) -> Self {
        Self {
            name: handler.name().to_string(),
            handler,
            policy: RetryPolicy::default(),
            circuit_breaker: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_circuit_breaker(mut self, dependency: impl Into<String>) -> Self {
        self.circuit_breaker = Some(dependency.into());
        self
    }
}

impl std::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("circuit_breaker", &self.circuit_breaker)
            .finish()
    }
}

/// Per-event-type handler lists.
///
/// Append-only; insertion order is invocation order. Cloning shares the
/// underlying table, so the bus and the executor see the same registrations.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Vec<RegisteredHandler>>>>,
    default_policy: RetryPolicy,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy given to handlers registered without one.
    pub fn with_default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    pub async fn register(&self, event_type: &str, registration: RegisteredHandler) {
        let count = {
            let mut handlers = self.handlers.write().await;
            let list = handlers.entry(event_type.to_string()).or_default();
            list.push(registration.clone());
            list.len()
        };

        info!(
            event_type = %event_type,
            handler = %registration.name,
            handler_count = count,
            "Registered event handler"
        );
    }

    /// Handlers for `event_type`, in registration order.
    pub async fn handlers_for(&self, event_type: &str) -> Vec<RegisteredHandler> {
        self.handlers
            .read()
            .await
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn find(&self, event_type: &str, handler_name: &str) -> Option<RegisteredHandler> {
        self.handlers
            .read()
            .await
            .get(event_type)
            .and_then(|list| list.iter().find(|h| h.name == handler_name).cloned())
    }

    /// `(event_type, handler_name)` pairs, sorted by type then registration order.
    pub async fn registrations(&self) -> Vec<(String, String)> {
        let handlers = self.handlers.read().await;
        let mut types: Vec<&String> = handlers.keys().collect();
        types.sort();
        types
            .into_iter()
            .flat_map(|t| handlers[t].iter().map(move |h| (t.clone(), h.name.clone())))
            .collect()
    }
}

/// What happened to one handler during a dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HandlerOutcome {
    Succeeded,
    /// Failed with no retry path (direct dispatch mode).
    Failed { error: String },
    /// Failed; a retry is scheduled after `delay`.
    RetryScheduled {
        retry_count: u32,
        #[serde(with = "duration_ms")]
        delay: Duration,
    },
    /// Retries exhausted; quarantined.
    DeadLettered { failed_event_id: Uuid },
}

/// Outcome of one handler for one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerResult {
    pub event_id: Uuid,
    pub event_type: String,
    pub handler_name: String,
    #[serde(flatten)]
    pub outcome: HandlerOutcome,
}

/// Per-handler results of a dispatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchReport {
    pub results: Vec<HandlerResult>,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == HandlerOutcome::Succeeded)
            .count()
    }

    /// Handlers that did not succeed on this pass (including scheduled retries).
    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn is_clean(&self) -> bool {
        self.failed() == 0
    }

    pub fn for_handler(&self, handler_name: &str) -> Vec<&HandlerResult> {
        self.results
            .iter()
            .filter(|r| r.handler_name == handler_name)
            .collect()
    }

    pub(crate) fn extend(&mut self, results: impl IntoIterator<Item = HandlerResult>) {
        self.results.extend(results);
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
