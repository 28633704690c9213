//! Circuit breakers for downstream dependencies.
//!
//! One breaker per dependency name, shared by every handler that calls that
//! dependency. State transitions for a call are applied under the breaker's
//! mutex, once on admission and once on completion.
//!
//! ```text
//! CLOSED --(failures >= threshold)--> OPEN
//! OPEN --(timeout elapsed, next call)--> HALF_OPEN
//! HALF_OPEN --(successes >= threshold)--> CLOSED
//! HALF_OPEN --(any failure)--> OPEN
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::{self, saturating_add, system_clock, Clock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(name)
    }
}

/// Breaker thresholds. Also the `circuit_breaker` configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip a closed breaker.
    pub failure_threshold: u32,
    /// How long an open breaker rejects calls before probing.
    pub timeout_secs: u64,
    /// Probe calls admitted while half-open.
    pub half_open_max_calls: u32,
    /// Probe successes needed to close again.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_secs: 60,
            half_open_max_calls: 3,
            success_threshold: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> chrono::Duration {
        clock::seconds(self.timeout_secs)
    }
}

/// Breaker-wrapped call outcome.
///
/// Rejections are distinguishable from the operation's own error, which is
/// always returned as `Inner`.
#[derive(Debug)]
pub enum CircuitError<E> {
    Open {
        name: String,
        retry_at: DateTime<Utc>,
    },
    HalfOpenSaturated {
        name: String,
    },
    Inner(E),
}

impl<E> CircuitError<E> {
    /// True when the breaker refused the call without running it.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, CircuitError::Inner(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitError::Open { name, retry_at } => {
                write!(f, "Circuit breaker '{}' is open until {}", name, retry_at)
            }
            CircuitError::HalfOpenSaturated { name } => write!(
                f,
                "Circuit breaker '{}' is half-open with no probe calls left",
                name
            ),
            CircuitError::Inner(e) => e.fmt(f),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for CircuitError<E> {}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_probe_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

/// Notified after every state transition.
#[async_trait]
pub trait BreakerObserver: Send + Sync {
    async fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState);
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_probe_count: u32,
    next_attempt_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl BreakerState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_probe_count: 0,
            next_attempt_at: None,
            last_failure_at: None,
            last_state_change: now,
            total_calls: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    fn move_to(&mut self, to: CircuitState, now: DateTime<Utc>) -> Option<Transition> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        self.last_state_change = now;
        Some(Transition { from, to })
    }

    fn trip(&mut self, now: DateTime<Utc>, config: &CircuitBreakerConfig) -> Option<Transition> {
        self.next_attempt_at = Some(saturating_add(now, config.timeout()));
        self.success_count = 0;
        self.half_open_probe_count = 0;
        self.move_to(CircuitState::Open, now)
    }

    fn close(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        self.failure_count = 0;
        self.success_count = 0;
        self.half_open_probe_count = 0;
        self.next_attempt_at = None;
        self.move_to(CircuitState::Closed, now)
    }
}

/// Breaker guarding one named dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
    observers: Vec<Arc<dyn BreakerObserver>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new(now)),
            clock,
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn BreakerObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Run `operation` through the breaker.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit().await;
        let transition = match admission {
            Ok(transition) => transition,
            Err(rejection) => {
                debug!(breaker = %self.name, "Call rejected by circuit breaker");
                return Err(rejection);
            }
        };
        self.notify(transition).await;

        let result = operation().await;

        let transition = self.record(result.is_ok()).await;
        self.notify(transition).await;

        result.map_err(CircuitError::Inner)
    }

    async fn admit<E>(&self) -> Result<Option<Transition>, CircuitError<E>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let mut transition = None;

        if state.state == CircuitState::Open {
            match state.next_attempt_at {
                Some(retry_at) if now < retry_at => {
                    state.total_rejections += 1;
                    return Err(CircuitError::Open {
                        name: self.name.clone(),
                        retry_at,
                    });
                }
                _ => {
                    state.half_open_probe_count = 0;
                    state.success_count = 0;
                    transition = state.move_to(CircuitState::HalfOpen, now);
                }
            }
        }

        if state.state == CircuitState::HalfOpen {
            if state.half_open_probe_count >= self.config.half_open_max_calls {
                state.total_rejections += 1;
                return Err(CircuitError::HalfOpenSaturated {
                    name: self.name.clone(),
                });
            }
            state.half_open_probe_count += 1;
        }

        state.total_calls += 1;
        Ok(transition)
    }

    async fn record(&self, success: bool) -> Option<Transition> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if success {
            match state.state {
                CircuitState::Closed => {
                    state.failure_count = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    state.success_count += 1;
                    if state.success_count >= self.config.success_threshold {
                        state.close(now)
                    } else {
                        None
                    }
                }
                // A call admitted before the breaker tripped.
                CircuitState::Open => None,
            }
        } else {
            state.total_failures += 1;
            state.last_failure_at = Some(now);
            match state.state {
                CircuitState::Closed => {
                    state.failure_count += 1;
                    if state.failure_count >= self.config.failure_threshold {
                        state.trip(now, &self.config)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    state.failure_count += 1;
                    state.trip(now, &self.config)
                }
                CircuitState::Open => None,
            }
        }
    }

    /// Force the breaker closed with all counters cleared.
    pub async fn reset(&self) {
        let now = self.clock.now();
        let transition = self.state.lock().await.close(now);
        info!(breaker = %self.name, "Circuit breaker reset");
        self.notify(transition).await;
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock().await;
        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            half_open_probe_count: state.half_open_probe_count,
            next_attempt_at: state.next_attempt_at,
            last_failure_at: state.last_failure_at,
            last_state_change: state.last_state_change,
            total_calls: state.total_calls,
            total_failures: state.total_failures,
            total_rejections: state.total_rejections,
        }
    }

    async fn notify(&self, transition: Option<Transition>) {
        let Some(Transition { from, to }) = transition else {
            return;
        };

        match to {
            CircuitState::Open => {
                warn!(breaker = %self.name, from = %from, to = %to, "Circuit breaker opened")
            }
            _ => info!(breaker = %self.name, from = %from, to = %to, "Circuit breaker state changed"),
        }

        for observer in &self.observers {
            observer.on_state_change(&self.name, from, to).await;
        }
    }
}

/// Lazily created breakers, one per dependency name.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    observers: Vec<Arc<dyn BreakerObserver>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self::with_clock(default_config, system_clock())
    }

    pub fn with_clock(default_config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
            clock,
            observers: Vec::new(),
        }
    }

    /// Observer attached to every breaker created afterwards.
    pub fn with_observer(mut self, observer: Arc<dyn BreakerObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Breaker for `name`, created with the default config on first use.
    pub async fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(name, || self.default_config.clone()).await
    }

    /// Breaker for `name`, created with `config` on first use.
    pub async fn get_with_config(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.get_or_create(name, || config).await
    }

    async fn get_or_create(
        &self,
        name: &str,
        config: impl FnOnce() -> CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(name) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            let mut breaker = CircuitBreaker::with_clock(name, config(), Arc::clone(&self.clock));
            for observer in &self.observers {
                breaker = breaker.with_observer(Arc::clone(observer));
            }
            debug!(breaker = %name, "Created circuit breaker");
            Arc::new(breaker)
        });
        Arc::clone(breaker)
    }

    pub async fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().await.get(name).cloned()
    }

    /// Reset one breaker. Returns `false` if no breaker has that name.
    pub async fn reset(&self, name: &str) -> bool {
        match self.find(name).await {
            Some(breaker) => {
                breaker.reset().await;
                true
            }
            None => false,
        }
    }

    pub async fn reset_all(&self) -> usize {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.read().await.values().cloned().collect();
        for breaker in &breakers {
            breaker.reset().await;
        }
        breakers.len()
    }

    /// Stats for every breaker, sorted by name.
    pub async fn stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            stats.push(breaker.stats().await);
        }
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}
