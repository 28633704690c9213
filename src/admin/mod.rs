//! Operator HTTP surface for event delivery.
//!
//! All routes live under `/admin/events`:
//! - `GET /dashboard`, `GET /health`, `GET /metrics`, `POST /metrics/reset`
//! - `GET /alerts`, `DELETE /alerts`
//! - `GET /failed-events`, `POST /failed-events/reprocess`, `DELETE /failed-events`
//! - `GET /circuit-breakers`, `POST /circuit-breakers/reset`,
//!   `POST /circuit-breakers/{name}/reset`
//! - `GET /outbox/stats`, `POST /outbox/publish`, `POST /outbox/redrive`

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::BrokerAdapter;
use crate::circuit::{CircuitBreakerRegistry, CircuitBreakerStats};
use crate::dlq::{DeadLetterQueue, DeadLetterSummary, FailedEvent};
use crate::monitoring::{
    Alert, AlertSeverity, DashboardSnapshot, EventMetric, EventMonitor, HealthStatus, SystemHealth,
};
use crate::outbox::OutboxStats;
use crate::publisher::{OutboxPublisher, SweepReport};
use crate::reliability::{ReliabilityExecutor, ReprocessReport};

/// Default number of alerts returned by `GET /alerts`.
const DEFAULT_ALERT_LIMIT: usize = 50;

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct AdminState {
    pub monitor: Arc<EventMonitor>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub dead_letters: Arc<DeadLetterQueue>,
    pub executor: Option<Arc<ReliabilityExecutor>>,
    pub publisher: Option<Arc<OutboxPublisher>>,
    pub broker: Option<Arc<dyn BrokerAdapter>>,
}

impl AdminState {
    pub fn new(
        monitor: Arc<EventMonitor>,
        breakers: Arc<CircuitBreakerRegistry>,
        dead_letters: Arc<DeadLetterQueue>,
    ) -> Self {
        Self {
            monitor,
            breakers,
            dead_letters,
            executor: None,
            publisher: None,
            broker: None,
        }
    }

    pub fn with_executor(mut self, executor: Arc<ReliabilityExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<OutboxPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn BrokerAdapter>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Health across handlers, breakers, broker connection and outbox.
    pub async fn health(&self) -> SystemHealth {
        let mut health = self
            .monitor
            .system_health(self.breakers.stats().await, self.dead_letters.len().await)
            .await;

        if let Some(broker) = &self.broker {
            health = health.with_broker(broker.is_connected());
        }
        if let Some(publisher) = &self.publisher {
            match publisher.store().stats().await {
                Ok(stats) => health = health.with_outbox(stats),
                Err(e) => warn!(error = %e, "Outbox stats unavailable for health check"),
            }
        }
        health
    }

    async fn pending_retries(&self) -> usize {
        match &self.executor {
            Some(executor) => executor.pending_retries().await.len(),
            None => 0,
        }
    }
}

/// Start the admin server on the given port until `shutdown` resolves.
///
/// When `port` is 0, the OS assigns an ephemeral port. The actual bound
/// port is always logged so it can be discovered.
pub async fn serve(
    state: AdminState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(state);
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let actual_port = listener.local_addr()?.port();
    info!(port = actual_port, "admin API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Build the axum router (separated for testing).
pub fn router(state: AdminState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let routes = Router::new()
        .route("/dashboard", get(dashboard))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/metrics/reset", post(reset_metrics))
        .route("/alerts", get(alerts).delete(clear_alerts))
        .route("/failed-events", get(failed_events).delete(clear_failed_events))
        .route("/failed-events/reprocess", post(reprocess_failed_events))
        .route("/circuit-breakers", get(circuit_breakers))
        .route("/circuit-breakers/reset", post(reset_circuit_breakers))
        .route("/circuit-breakers/{name}/reset", post(reset_circuit_breaker))
        .route("/outbox/stats", get(outbox_stats))
        .route("/outbox/publish", post(publish_outbox))
        .route("/outbox/redrive", post(redrive_outbox));

    Router::new()
        .nest("/admin/events", routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Query / Body Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    event_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    severity: Option<AlertSeverity>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct OlderThanQuery {
    older_than_hours: Option<i64>,
}

impl OlderThanQuery {
    /// Rejects negative or out-of-range hour counts with 400.
    fn cutoff_age(&self) -> Result<Option<chrono::Duration>, StatusCode> {
        let Some(hours) = self.older_than_hours else {
            return Ok(None);
        };
        match chrono::Duration::try_hours(hours) {
            Some(age) if hours >= 0 => Ok(Some(age)),
            _ => {
                warn!(older_than_hours = hours, "Rejected out-of-range age filter");
                Err(StatusCode::BAD_REQUEST)
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ReprocessRequest {
    ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Deserialize)]
struct PublishQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct FailedEventsResponse {
    events: Vec<FailedEvent>,
    summary: DeadLetterSummary,
}

// ============================================================================
// Handlers
// ============================================================================

async fn dashboard(State(state): State<AdminState>) -> Json<DashboardSnapshot> {
    let health = state.health().await;
    let summary = state.dead_letters.summary().await;
    let pending = state.pending_retries().await;
    Json(state.monitor.dashboard(health, summary, pending).await)
}

async fn health(State(state): State<AdminState>) -> (StatusCode, Json<SystemHealth>) {
    let health = state.health().await;
    let code = match health.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    (code, Json(health))
}

async fn metrics(
    State(state): State<AdminState>,
    Query(query): Query<MetricsQuery>,
) -> Json<Vec<EventMetric>> {
    Json(state.monitor.metrics(query.event_type.as_deref()).await)
}

async fn reset_metrics(State(state): State<AdminState>) -> StatusCode {
    state.monitor.reset_metrics().await;
    info!("Metrics reset by operator");
    StatusCode::NO_CONTENT
}

async fn alerts(
    State(state): State<AdminState>,
    Query(query): Query<AlertsQuery>,
) -> Json<Vec<Alert>> {
    let limit = query.limit.unwrap_or(DEFAULT_ALERT_LIMIT);
    Json(state.monitor.alerts(query.severity, limit).await)
}

async fn clear_alerts(
    State(state): State<AdminState>,
    Query(query): Query<OlderThanQuery>,
) -> Result<Json<Value>, StatusCode> {
    let cleared = state.monitor.clear_alerts(query.cutoff_age()?).await;
    Ok(Json(json!({ "cleared": cleared })))
}

async fn failed_events(State(state): State<AdminState>) -> Json<FailedEventsResponse> {
    Json(FailedEventsResponse {
        events: state.dead_letters.list().await,
        summary: state.dead_letters.summary().await,
    })
}

async fn reprocess_failed_events(
    State(state): State<AdminState>,
    body: Option<Json<ReprocessRequest>>,
) -> Result<Json<ReprocessReport>, StatusCode> {
    let executor = state
        .executor
        .as_ref()
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    let request = body.map(|Json(request)| request).unwrap_or_default();

    let report = executor
        .reprocess_failed_events(request.ids.as_deref())
        .await;
    info!(
        attempted = report.attempted,
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        "Failed events reprocessed"
    );
    Ok(Json(report))
}

async fn clear_failed_events(
    State(state): State<AdminState>,
    Query(query): Query<OlderThanQuery>,
) -> Result<Json<Value>, StatusCode> {
    let cleared = state.dead_letters.clear(query.cutoff_age()?).await;
    Ok(Json(json!({ "cleared": cleared })))
}

async fn circuit_breakers(State(state): State<AdminState>) -> Json<Vec<CircuitBreakerStats>> {
    Json(state.breakers.stats().await)
}

async fn reset_circuit_breakers(State(state): State<AdminState>) -> Json<Value> {
    let reset = state.breakers.reset_all().await;
    Json(json!({ "reset": reset }))
}

async fn reset_circuit_breaker(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    if state.breakers.reset(&name).await {
        Ok(Json(json!({ "reset": 1 })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

fn publisher(state: &AdminState) -> Result<&Arc<OutboxPublisher>, StatusCode> {
    state
        .publisher
        .as_ref()
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)
}

async fn outbox_stats(State(state): State<AdminState>) -> Result<Json<OutboxStats>, StatusCode> {
    let stats = publisher(&state)?.store().stats().await.map_err(|e| {
        error!(error = %e, "failed to read outbox stats");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(stats))
}

async fn publish_outbox(
    State(state): State<AdminState>,
    Query(query): Query<PublishQuery>,
) -> Result<Json<SweepReport>, StatusCode> {
    let publisher = publisher(&state)?;
    let limit = query.limit.unwrap_or(publisher.config().batch_size);
    let report = publisher.publish_pending(limit).await.map_err(|e| {
        error!(error = %e, "manual outbox drain failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(report))
}

async fn redrive_outbox(State(state): State<AdminState>) -> Result<Json<SweepReport>, StatusCode> {
    let report = publisher(&state)?.redrive_failed().await.map_err(|e| {
        error!(error = %e, "outbox redrive failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests;
