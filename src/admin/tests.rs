//! Router tests driven through `tower::ServiceExt::oneshot`.

use axum::body::Body;
use http::Request;
use tower::ServiceExt;

use super::*;
use crate::broker::InMemoryBroker;
use crate::bus::{HandlerRegistry, RegisteredHandler};
use crate::circuit::CircuitBreakerConfig;
use crate::event::{Event, EventEnvelope};
use crate::monitoring::AlertType;
use crate::outbox::{InMemoryOutboxStore, OutboxConfig, OutboxEvent, OutboxStore};
use crate::test_utils::{FlakyHandler, QuestionCreated};

struct Fixture {
    state: AdminState,
    store: Arc<InMemoryOutboxStore>,
    broker: Arc<InMemoryBroker>,
}

async fn fixture() -> Fixture {
    let monitor = Arc::new(EventMonitor::default());
    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: 1,
        ..Default::default()
    }));
    let dead_letters = Arc::new(DeadLetterQueue::new());
    let executor = Arc::new(
        ReliabilityExecutor::new(HandlerRegistry::new(), dead_letters.clone())
            .with_circuit_breakers(breakers.clone())
            .with_observer(monitor.clone()),
    );

    let store = Arc::new(InMemoryOutboxStore::new(5));
    let broker = Arc::new(InMemoryBroker::new());
    broker.connect().await.unwrap();
    let publisher = Arc::new(OutboxPublisher::new(
        store.clone(),
        broker.clone(),
        OutboxConfig::default(),
    ));

    let state = AdminState::new(monitor, breakers, dead_letters)
        .with_executor(executor)
        .with_publisher(publisher)
        .with_broker(broker.clone());

    Fixture {
        state,
        store,
        broker,
    }
}

async fn send(state: &AdminState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).unwrap())
        }
        None => Body::empty(),
    };

    let resp = router(state.clone())
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn quarantine(state: &AdminState, title: &str) -> Uuid {
    let event = Arc::new(Event::new("q-1", QuestionCreated::new(title)));
    state
        .dead_letters
        .push(event, "search", "index offline", 3)
        .await
        .id
}

#[tokio::test]
async fn test_health_reports_broker_and_outbox() {
    let f = fixture().await;
    let (status, json) = send(&f.state, "GET", "/admin/events/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "HEALTHY");
    assert_eq!(json["brokerConnected"], true);
    assert_eq!(json["outbox"]["pending"], 0);
}

#[tokio::test]
async fn test_health_unavailable_when_broker_down() {
    let f = fixture().await;
    f.broker.disconnect();

    let (status, json) = send(&f.state, "GET", "/admin/events/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "UNHEALTHY");
}

#[tokio::test]
async fn test_dashboard_snapshot() {
    let f = fixture().await;
    quarantine(&f.state, "Dashboard?").await;

    let (status, json) = send(&f.state, "GET", "/admin/events/dashboard", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["deadLetters"]["total"], 1);
    assert_eq!(json["pendingRetries"], 0);
    assert_eq!(json["health"]["failedEvents"], 1);
}

#[tokio::test]
async fn test_alerts_filter_and_clear() {
    let f = fixture().await;
    let monitor = &f.state.monitor;
    monitor
        .raise_alert(AlertType::Performance, AlertSeverity::Warning, "slow", None, None, Default::default())
        .await;
    monitor
        .raise_alert(AlertType::DeadLetter, AlertSeverity::Critical, "stuck", None, None, Default::default())
        .await;

    let (_, json) = send(&f.state, "GET", "/admin/events/alerts?severity=CRITICAL", None).await;
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["type"], "DEAD_LETTER");

    let (_, json) = send(&f.state, "GET", "/admin/events/alerts?limit=1", None).await;
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["message"], "stuck");

    let (_, json) = send(&f.state, "DELETE", "/admin/events/alerts?older_than_hours=1", None).await;
    assert_eq!(json["cleared"], 0);
    let (_, json) = send(&f.state, "DELETE", "/admin/events/alerts", None).await;
    assert_eq!(json["cleared"], 2);
}

#[tokio::test]
async fn test_age_filters_reject_out_of_range_hours() {
    let f = fixture().await;
    quarantine(&f.state, "Kept").await;
    f.state
        .monitor
        .raise_alert(AlertType::Failure, AlertSeverity::Info, "kept", None, None, Default::default())
        .await;

    for uri in [
        "/admin/events/alerts?older_than_hours=9223372036854775807",
        "/admin/events/failed-events?older_than_hours=9223372036854775807",
        "/admin/events/alerts?older_than_hours=-1",
    ] {
        let (status, _) = send(&f.state, "DELETE", uri, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
    }

    let (status, json) = send(
        &f.state,
        "DELETE",
        "/admin/events/alerts?older_than_hours=1000000000000",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["cleared"], 0);

    let (status, json) = send(
        &f.state,
        "DELETE",
        "/admin/events/failed-events?older_than_hours=1000000000000",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["cleared"], 0);
    assert_eq!(f.state.dead_letters.len().await, 1);
}

#[tokio::test]
async fn test_metrics_filter_and_reset() {
    let f = fixture().await;
    let executor = f.state.executor.clone().unwrap();
    let event: Arc<dyn crate::event::DomainEvent> =
        Arc::new(Event::new("q-1", QuestionCreated::new("Metrics?")));
    let registration = RegisteredHandler::new(FlakyHandler::arc("search", 0));
    executor.dispatch(event, vec![registration]).await;

    let (_, json) = send(&f.state, "GET", "/admin/events/metrics?event_type=QuestionCreated", None).await;
    assert_eq!(json[0]["executions"], 1);
    let (_, json) = send(&f.state, "GET", "/admin/events/metrics?event_type=AnswerPosted", None).await;
    assert!(json.as_array().unwrap().is_empty());

    let (status, _) = send(&f.state, "POST", "/admin/events/metrics/reset", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, json) = send(&f.state, "GET", "/admin/events/metrics", None).await;
    assert!(json.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_events_listing_and_clear() {
    let f = fixture().await;
    quarantine(&f.state, "One").await;
    quarantine(&f.state, "Two").await;

    let (_, json) = send(&f.state, "GET", "/admin/events/failed-events", None).await;
    assert_eq!(json["events"].as_array().unwrap().len(), 2);
    assert_eq!(json["summary"]["byHandler"][0]["key"], "search");
    assert_eq!(json["summary"]["byHandler"][0]["count"], 2);

    let (_, json) = send(&f.state, "DELETE", "/admin/events/failed-events", None).await;
    assert_eq!(json["cleared"], 2);
    assert!(f.state.dead_letters.is_empty().await);
}

#[tokio::test]
async fn test_reprocess_reports_unknown_ids() {
    let f = fixture().await;
    let id = quarantine(&f.state, "No handler registered").await;
    let missing = Uuid::new_v4();

    let (status, json) = send(
        &f.state,
        "POST",
        "/admin/events/failed-events/reprocess",
        Some(json!({ "ids": [id, missing] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["attempted"], 1);
    assert_eq!(json["notFound"][0], missing.to_string());
    assert_eq!(json["failed"][0]["id"], id.to_string());

    let (status, json) = send(&f.state, "POST", "/admin/events/failed-events/reprocess", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["attempted"], 1);
}

#[tokio::test]
async fn test_circuit_breaker_reset() {
    let f = fixture().await;
    let breaker = f.state.breakers.get("search-index").await;
    breaker
        .execute(|| async { Err::<(), _>("down") })
        .await
        .unwrap_err();

    let (_, json) = send(&f.state, "GET", "/admin/events/circuit-breakers", None).await;
    assert_eq!(json[0]["state"], "OPEN");

    let (status, _) = send(&f.state, "POST", "/admin/events/circuit-breakers/missing/reset", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&f.state, "POST", "/admin/events/circuit-breakers/search-index/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = send(&f.state, "GET", "/admin/events/circuit-breakers", None).await;
    assert_eq!(json[0]["state"], "CLOSED");

    let (_, json) = send(&f.state, "POST", "/admin/events/circuit-breakers/reset", None).await;
    assert_eq!(json["reset"], 1);
}

#[tokio::test]
async fn test_outbox_stats_and_manual_drain() {
    let f = fixture().await;
    for title in ["A", "B", "C"] {
        let event = Event::new("q-1", QuestionCreated::new(title));
        let row = OutboxEvent::from_envelope(EventEnvelope::from_event(&event, "Question").unwrap());
        f.store.save_many(&[row]).await.unwrap();
    }

    let (_, json) = send(&f.state, "GET", "/admin/events/outbox/stats", None).await;
    assert_eq!(json["pending"], 3);

    let (_, json) = send(&f.state, "POST", "/admin/events/outbox/publish?limit=2", None).await;
    assert_eq!(json["published"], 2);
    assert_eq!(f.broker.published_count().await, 2);

    let (_, json) = send(&f.state, "POST", "/admin/events/outbox/redrive", None).await;
    assert_eq!(json["fetched"], 0);
}

#[tokio::test]
async fn test_outbox_routes_unavailable_without_publisher() {
    let f = fixture().await;
    let state = AdminState {
        publisher: None,
        executor: None,
        ..f.state
    };

    let (status, _) = send(&state, "GET", "/admin/events/outbox/stats", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let (status, _) = send(&state, "POST", "/admin/events/failed-events/reprocess", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

