//! Execution metrics, handler health, and alerting.
//!
//! `EventMonitor` observes the reliability executor and every circuit
//! breaker. It keeps per-(event type, handler) counters and health records,
//! plus a bounded ring buffer of alerts.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::circuit::{BreakerObserver, CircuitBreakerStats, CircuitState};
use crate::clock::{saturating_sub, system_clock, Clock};
use crate::dlq::{DeadLetterSummary, FailedEvent};
use crate::outbox::OutboxStats;
use crate::reliability::{ExecutionContext, ExecutionObserver};

/// Alerting thresholds. Also the `monitoring` configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Executions slower than this raise a performance alert.
    pub slow_execution_ms: u64,
    /// Alerts kept in memory; oldest are evicted first.
    pub alert_capacity: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            slow_execution_ms: 5000,
            alert_capacity: 100,
        }
    }
}

// ============================================================================
// Health
// ============================================================================

/// Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// `HEALTHY` up to 20% errors, `DEGRADED` up to 50%, else `UNHEALTHY`.
    pub fn from_error_rate(rate: f64) -> Self {
        if rate <= 0.2 {
            HealthStatus::Healthy
        } else if rate <= 0.5 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Rolling health of one handler for one event type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerHealth {
    pub event_type: String,
    pub handler_name: String,
    pub status: HealthStatus,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub last_error: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl HandlerHealth {
    fn new(ctx: &ExecutionContext, now: DateTime<Utc>) -> Self {
        Self {
            event_type: ctx.event_type.clone(),
            handler_name: ctx.handler_name.clone(),
            status: HealthStatus::Healthy,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            error_rate: 0.0,
            average_latency_ms: 0.0,
            last_error: None,
            last_updated: now,
        }
    }

    fn refresh(&mut self, now: DateTime<Utc>) {
        self.error_rate = if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        };
        self.status = HealthStatus::from_error_rate(self.error_rate);
        self.last_updated = now;
    }

    fn record_latency(&mut self, elapsed: Duration) {
        let finished = self.successful_requests + self.failed_requests;
        self.average_latency_ms = running_average(self.average_latency_ms, elapsed, finished);
    }
}

/// Overall health: worst handler status, open breakers, broker and outbox state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub handlers: Vec<HandlerHealth>,
    pub circuit_breakers: Vec<CircuitBreakerStats>,
    pub failed_events: usize,
    pub broker_connected: Option<bool>,
    pub outbox: Option<OutboxStats>,
    pub checked_at: DateTime<Utc>,
}

impl SystemHealth {
    /// A disconnected broker makes the system unhealthy.
    pub fn with_broker(mut self, connected: bool) -> Self {
        self.broker_connected = Some(connected);
        if !connected {
            self.status = HealthStatus::Unhealthy;
        }
        self
    }

    /// Outbox rows stuck at the attempt ceiling degrade health.
    pub fn with_outbox(mut self, stats: OutboxStats) -> Self {
        if stats.failed > 0 {
            self.status = self.status.max(HealthStatus::Degraded);
        }
        self.outbox = Some(stats);
        self
    }
}

// ============================================================================
// Metrics and alerts
// ============================================================================

/// Counters for one (event type, handler) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetric {
    pub event_type: String,
    pub handler_name: String,
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub dead_letters: u64,
    pub average_latency_ms: f64,
    pub last_execution_at: Option<DateTime<Utc>>,
}

impl EventMetric {
    fn new(ctx: &ExecutionContext) -> Self {
        Self {
            event_type: ctx.event_type.clone(),
            handler_name: ctx.handler_name.clone(),
            executions: 0,
            successes: 0,
            failures: 0,
            retries: 0,
            dead_letters: 0,
            average_latency_ms: 0.0,
            last_execution_at: None,
        }
    }

    fn record(&mut self, elapsed: Duration, success: bool, now: DateTime<Utc>) {
        self.executions += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.average_latency_ms = running_average(self.average_latency_ms, elapsed, self.executions);
        self.last_execution_at = Some(now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    Failure,
    Performance,
    DeadLetter,
    CircuitBreaker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub event_type: Option<String>,
    pub handler_name: Option<String>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// Everything an operator dashboard shows, in one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub health: SystemHealth,
    pub metrics: Vec<EventMetric>,
    pub recent_alerts: Vec<Alert>,
    pub dead_letters: DeadLetterSummary,
    pub pending_retries: usize,
    pub generated_at: DateTime<Utc>,
}

type HandlerKey = (String, String);

fn key(ctx: &ExecutionContext) -> HandlerKey {
    (ctx.event_type.clone(), ctx.handler_name.clone())
}

fn running_average(average: f64, sample: Duration, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    let sample_ms = sample.as_secs_f64() * 1000.0;
    average + (sample_ms - average) / count as f64
}

#[derive(Default)]
struct MonitorState {
    metrics: HashMap<HandlerKey, EventMetric>,
    health: HashMap<HandlerKey, HandlerHealth>,
    alerts: VecDeque<Alert>,
}

// ============================================================================
// Monitor
// ============================================================================

/// Observer that turns execution and breaker notifications into metrics,
/// health records, and alerts.
pub struct EventMonitor {
    config: MonitoringConfig,
    clock: Arc<dyn Clock>,
    state: RwLock<MonitorState>,
}

impl Default for EventMonitor {
    fn default() -> Self {
        Self::new(MonitoringConfig::default())
    }
}

impl EventMonitor {
    pub fn new(config: MonitoringConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: MonitoringConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: RwLock::new(MonitorState::default()),
        }
    }

    /// Metrics sorted by event type then handler, optionally for one event type.
    pub async fn metrics(&self, event_type: Option<&str>) -> Vec<EventMetric> {
        let state = self.state.read().await;
        let mut metrics: Vec<EventMetric> = state
            .metrics
            .values()
            .filter(|m| event_type.map_or(true, |t| m.event_type == t))
            .cloned()
            .collect();
        metrics.sort_by(|a, b| {
            (&a.event_type, &a.handler_name).cmp(&(&b.event_type, &b.handler_name))
        });
        metrics
    }

    pub async fn handler_health(&self) -> Vec<HandlerHealth> {
        let state = self.state.read().await;
        let mut health: Vec<HandlerHealth> = state.health.values().cloned().collect();
        health.sort_by(|a, b| {
            (&a.event_type, &a.handler_name).cmp(&(&b.event_type, &b.handler_name))
        });
        health
    }

    /// Clear metrics and health records. Alerts are kept.
    pub async fn reset_metrics(&self) {
        let mut state = self.state.write().await;
        state.metrics.clear();
        state.health.clear();
        info!("Event metrics reset");
    }

    /// Alerts newest first, optionally at or above `min_severity`.
    pub async fn alerts(&self, min_severity: Option<AlertSeverity>, limit: usize) -> Vec<Alert> {
        self.state
            .read()
            .await
            .alerts
            .iter()
            .rev()
            .filter(|a| min_severity.map_or(true, |s| a.severity >= s))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Drop alerts, or only those older than `older_than`.
    pub async fn clear_alerts(&self, older_than: Option<chrono::Duration>) -> usize {
        let mut state = self.state.write().await;
        let before = state.alerts.len();
        match older_than {
            Some(age) => {
                let cutoff = saturating_sub(self.clock.now(), age);
                state.alerts.retain(|a| a.created_at >= cutoff);
            }
            None => state.alerts.clear(),
        }
        before - state.alerts.len()
    }

    /// Append an alert, evicting the oldest once at capacity.
    pub async fn raise_alert(
        &self,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: impl Into<String>,
        event_type: Option<&str>,
        handler_name: Option<&str>,
        metadata: Map<String, Value>,
    ) -> Alert {
        let alert = Alert {
            id: Uuid::new_v4(),
            alert_type,
            severity,
            message: message.into(),
            event_type: event_type.map(str::to_string),
            handler_name: handler_name.map(str::to_string),
            metadata,
            created_at: self.clock.now(),
        };

        match severity {
            AlertSeverity::Critical | AlertSeverity::Error => error!(
                alert_type = ?alert.alert_type,
                severity = ?alert.severity,
                message = %alert.message,
                "Alert raised"
            ),
            _ => warn!(
                alert_type = ?alert.alert_type,
                severity = ?alert.severity,
                message = %alert.message,
                "Alert raised"
            ),
        }

        let mut state = self.state.write().await;
        while state.alerts.len() >= self.config.alert_capacity.max(1) {
            state.alerts.pop_front();
        }
        state.alerts.push_back(alert.clone());
        alert
    }

    /// A broker message that could not be decoded and went to the broker DLQ.
    pub async fn record_undeliverable_message(&self, event_type: Option<&str>, reason: &str) {
        let mut metadata = Map::new();
        metadata.insert("reason".to_string(), Value::String(reason.to_string()));
        metadata.insert("origin".to_string(), Value::String("broker".to_string()));

        self.raise_alert(
            AlertType::DeadLetter,
            AlertSeverity::Critical,
            format!(
                "Undecodable {} message dead-lettered by broker",
                event_type.unwrap_or("unknown")
            ),
            event_type,
            None,
            metadata,
        )
        .await;
    }

    /// Combine handler health with breaker snapshots.
    ///
    /// Any open breaker makes the system at least degraded.
    pub async fn system_health(
        &self,
        circuit_breakers: Vec<CircuitBreakerStats>,
        failed_events: usize,
    ) -> SystemHealth {
        let handlers = self.handler_health().await;
        let mut status = handlers
            .iter()
            .map(|h| h.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        if circuit_breakers
            .iter()
            .any(|b| b.state == CircuitState::Open)
        {
            status = status.max(HealthStatus::Degraded);
        }

        SystemHealth {
            status,
            handlers,
            circuit_breakers,
            failed_events,
            broker_connected: None,
            outbox: None,
            checked_at: self.clock.now(),
        }
    }

    pub async fn dashboard(
        &self,
        health: SystemHealth,
        dead_letters: DeadLetterSummary,
        pending_retries: usize,
    ) -> DashboardSnapshot {
        DashboardSnapshot {
            health,
            metrics: self.metrics(None).await,
            recent_alerts: self.alerts(None, 10).await,
            dead_letters,
            pending_retries,
            generated_at: self.clock.now(),
        }
    }

    fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.config.slow_execution_ms)
    }
}

fn handler_metadata(ctx: &ExecutionContext) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("eventId".to_string(), Value::String(ctx.event_id.to_string()));
    metadata.insert("aggregateId".to_string(), Value::String(ctx.aggregate_id.clone()));
    metadata.insert("retryCount".to_string(), Value::from(ctx.retry_count));
    metadata.insert("maxRetries".to_string(), Value::from(ctx.max_retries));
    metadata
}

#[async_trait]
impl ExecutionObserver for EventMonitor {
    async fn on_started(&self, ctx: &ExecutionContext) {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let health = state
            .health
            .entry(key(ctx))
            .or_insert_with(|| HandlerHealth::new(ctx, now));
        health.total_requests += 1;
        health.refresh(now);
    }

    async fn on_completed(&self, ctx: &ExecutionContext, elapsed: Duration) {
        let now = self.clock.now();
        {
            let mut state = self.state.write().await;
            state
                .metrics
                .entry(key(ctx))
                .or_insert_with(|| EventMetric::new(ctx))
                .record(elapsed, true, now);

            let health = state
                .health
                .entry(key(ctx))
                .or_insert_with(|| HandlerHealth::new(ctx, now));
            health.successful_requests += 1;
            health.record_latency(elapsed);
            health.refresh(now);
        }

        if elapsed > self.slow_threshold() {
            let mut metadata = handler_metadata(ctx);
            metadata.insert("durationMs".to_string(), Value::from(elapsed.as_millis() as u64));
            metadata.insert(
                "thresholdMs".to_string(),
                Value::from(self.config.slow_execution_ms),
            );
            self.raise_alert(
                AlertType::Performance,
                AlertSeverity::Warning,
                format!(
                    "{} took {}ms handling {}",
                    ctx.handler_name,
                    elapsed.as_millis(),
                    ctx.event_type
                ),
                Some(&ctx.event_type),
                Some(&ctx.handler_name),
                metadata,
            )
            .await;
        }
    }

    async fn on_failed(&self, ctx: &ExecutionContext, error: &str, elapsed: Duration) {
        let now = self.clock.now();
        {
            let mut state = self.state.write().await;
            state
                .metrics
                .entry(key(ctx))
                .or_insert_with(|| EventMetric::new(ctx))
                .record(elapsed, false, now);

            let health = state
                .health
                .entry(key(ctx))
                .or_insert_with(|| HandlerHealth::new(ctx, now));
            health.failed_requests += 1;
            health.last_error = Some(error.to_string());
            health.record_latency(elapsed);
            health.refresh(now);
        }

        let severity = if ctx.is_final_attempt() {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Error
        };
        let mut metadata = handler_metadata(ctx);
        metadata.insert("error".to_string(), Value::String(error.to_string()));
        self.raise_alert(
            AlertType::Failure,
            severity,
            format!(
                "{} failed handling {} (attempt {} of {})",
                ctx.handler_name,
                ctx.event_type,
                ctx.retry_count + 1,
                ctx.max_retries + 1
            ),
            Some(&ctx.event_type),
            Some(&ctx.handler_name),
            metadata,
        )
        .await;
    }

    async fn on_retrying(&self, ctx: &ExecutionContext, _delay: Duration) {
        let mut state = self.state.write().await;
        state
            .metrics
            .entry(key(ctx))
            .or_insert_with(|| EventMetric::new(ctx))
            .retries += 1;
    }

    async fn on_dead_lettered(&self, ctx: &ExecutionContext, failed: &FailedEvent) {
        {
            let mut state = self.state.write().await;
            state
                .metrics
                .entry(key(ctx))
                .or_insert_with(|| EventMetric::new(ctx))
                .dead_letters += 1;
        }

        let mut metadata = handler_metadata(ctx);
        metadata.insert("failedEventId".to_string(), Value::String(failed.id.to_string()));
        metadata.insert("error".to_string(), Value::String(failed.error.clone()));
        self.raise_alert(
            AlertType::DeadLetter,
            AlertSeverity::Critical,
            format!(
                "{} moved {} to dead letters after {} retries",
                ctx.handler_name, ctx.event_type, failed.retry_count
            ),
            Some(&ctx.event_type),
            Some(&ctx.handler_name),
            metadata,
        )
        .await;
    }
}

#[async_trait]
impl BreakerObserver for EventMonitor {
    async fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState) {
        let severity = match to {
            CircuitState::Open => AlertSeverity::Error,
            CircuitState::HalfOpen => AlertSeverity::Warning,
            CircuitState::Closed => AlertSeverity::Info,
        };
        let mut metadata = Map::new();
        metadata.insert("breaker".to_string(), Value::String(name.to_string()));
        metadata.insert("from".to_string(), Value::String(from.to_string()));
        metadata.insert("to".to_string(), Value::String(to.to_string()));

        self.raise_alert(
            AlertType::CircuitBreaker,
            severity,
            format!("Circuit breaker '{}' changed {} -> {}", name, from, to),
            None,
            None,
            metadata,
        )
        .await;
    }
}
