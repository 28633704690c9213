use super::*;
use crate::broker::InMemoryBroker;
use crate::clock::ManualClock;
use crate::event::{Event, EventEnvelope};
use crate::outbox::InMemoryOutboxStore;
use crate::test_utils::QuestionCreated;

struct Fixture {
    store: Arc<InMemoryOutboxStore>,
    broker: Arc<InMemoryBroker>,
    clock: Arc<ManualClock>,
    publisher: Arc<OutboxPublisher>,
}

async fn fixture(config: OutboxConfig) -> Fixture {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(InMemoryOutboxStore::with_clock(config.max_attempts, clock.clone()));
    let broker = Arc::new(InMemoryBroker::new());
    broker.connect().await.unwrap();
    let publisher = Arc::new(OutboxPublisher::with_clock(
        store.clone(),
        broker.clone(),
        config,
        clock.clone(),
    ));
    Fixture {
        store,
        broker,
        clock,
        publisher,
    }
}

async fn stage(f: &Fixture, aggregate_id: &str, title: &str, minutes_ago: i64) -> OutboxEvent {
    let at = f.clock.now() - chrono::Duration::minutes(minutes_ago);
    let event = Event::new(aggregate_id, QuestionCreated::new(title)).occurred(at);
    let row = OutboxEvent::from_envelope(EventEnvelope::from_event(&event, "Question").unwrap());
    f.store.save_many(&[row.clone()]).await.unwrap();
    row
}

#[tokio::test]
async fn test_publishes_oldest_first_and_marks_rows() {
    let f = fixture(OutboxConfig::default()).await;
    let second = stage(&f, "q-2", "Second", 1).await;
    let first = stage(&f, "q-1", "First", 2).await;

    let report = f.publisher.publish_pending(10).await.unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(report.published, 2);

    let ids: Vec<_> = f.broker.published().await.iter().map(|e| e.event_id).collect();
    assert_eq!(ids, vec![first.event_id, second.event_id]);
    assert!(f.store.get(first.event_id).await.unwrap().unwrap().published);
    assert!(f.store.find_unpublished(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_publish_retried_on_next_sweep() {
    let f = fixture(OutboxConfig::default()).await;
    let row = stage(&f, "q-1", "Flaky broker", 0).await;
    f.broker.reject_next(2);

    for _ in 0..2 {
        let report = f.publisher.tick().await.unwrap();
        assert_eq!(report.failed, 1);
    }
    let report = f.publisher.tick().await.unwrap();
    assert_eq!(report.published, 1);

    let stored = f.store.get(row.event_id).await.unwrap().unwrap();
    assert!(stored.published);
    assert_eq!(stored.attempts, 2);
    assert!(stored.error_message.unwrap().contains("rejected"));
    assert_eq!(f.broker.published_count().await, 1);
}

#[tokio::test]
async fn test_failure_skips_rest_of_aggregate_only() {
    let f = fixture(OutboxConfig::default()).await;
    let a1 = stage(&f, "q-a", "A1", 3).await;
    let a2 = stage(&f, "q-a", "A2", 2).await;
    let b1 = stage(&f, "q-b", "B1", 1).await;
    f.broker.reject_next(1);

    let report = f.publisher.tick().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.published, 1);

    assert_eq!(f.store.get(a1.event_id).await.unwrap().unwrap().attempts, 1);
    let held = f.store.get(a2.event_id).await.unwrap().unwrap();
    assert_eq!(held.attempts, 0);
    assert!(!held.published);
    assert!(f.store.get(b1.event_id).await.unwrap().unwrap().published);

    f.publisher.tick().await.unwrap();
    let ids: Vec<_> = f.broker.published().await.iter().map(|e| e.event_id).collect();
    assert_eq!(ids, vec![b1.event_id, a1.event_id, a2.event_id]);
}

#[tokio::test]
async fn test_tick_is_noop_while_sweep_in_flight() {
    let f = fixture(OutboxConfig::default()).await;
    stage(&f, "q-1", "Busy?", 0).await;

    let guard = f.publisher.in_flight.lock().await;
    let report = f.publisher.tick().await.unwrap();
    assert!(report.busy);
    assert_eq!(report.fetched, 0);
    drop(guard);

    let report = f.publisher.tick().await.unwrap();
    assert!(!report.busy);
    assert_eq!(report.published, 1);
}

#[tokio::test]
async fn test_disconnected_broker_counts_attempts() {
    let f = fixture(OutboxConfig {
        max_attempts: 2,
        ..Default::default()
    })
    .await;
    let row = stage(&f, "q-1", "Offline", 0).await;
    f.broker.disconnect();

    f.publisher.tick().await.unwrap();
    f.publisher.tick().await.unwrap();
    let report = f.publisher.tick().await.unwrap();
    assert_eq!(report.fetched, 0);

    let stored = f.store.get(row.event_id).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 2);
    assert_eq!(f.store.stats().await.unwrap().failed, 1);
}

#[tokio::test]
async fn test_redrive_after_cooldown() {
    let f = fixture(OutboxConfig {
        max_attempts: 1,
        redrive_cooldown_secs: 60,
        ..Default::default()
    })
    .await;
    let row = stage(&f, "q-1", "Stuck", 0).await;
    f.broker.set_fail_on_publish(true);
    f.publisher.tick().await.unwrap();
    f.broker.set_fail_on_publish(false);

    let report = f.publisher.redrive_failed().await.unwrap();
    assert_eq!(report.fetched, 0);

    f.clock.advance(chrono::Duration::seconds(61));
    let report = f.publisher.redrive_failed().await.unwrap();
    assert_eq!(report.published, 1);
    assert!(f.store.get(row.event_id).await.unwrap().unwrap().published);
}

#[tokio::test]
async fn test_retention_sweep_uses_configured_window() {
    let f = fixture(OutboxConfig {
        retention_days: 1,
        ..Default::default()
    })
    .await;
    let row = stage(&f, "q-1", "Old news", 0).await;
    f.publisher.publish_pending(10).await.unwrap();

    assert_eq!(f.publisher.sweep_retention().await.unwrap(), 0);
    f.clock.advance(chrono::Duration::hours(25));
    assert_eq!(f.publisher.sweep_retention().await.unwrap(), 1);
    assert!(f.store.get(row.event_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_huge_retention_and_cooldown_do_not_overflow() {
    let f = fixture(OutboxConfig {
        max_attempts: 1,
        retention_days: u32::MAX,
        redrive_cooldown_secs: u64::MAX,
        ..Default::default()
    })
    .await;
    let kept = stage(&f, "q-1", "Kept forever", 0).await;
    f.publisher.publish_pending(10).await.unwrap();
    assert_eq!(f.publisher.sweep_retention().await.unwrap(), 0);
    assert!(f.store.get(kept.event_id).await.unwrap().is_some());

    let stuck = stage(&f, "q-2", "Never redriven", 0).await;
    f.broker.set_fail_on_publish(true);
    f.publisher.tick().await.unwrap();
    f.broker.set_fail_on_publish(false);
    f.clock.advance(chrono::Duration::days(365));

    let report = f.publisher.redrive_failed().await.unwrap();
    assert_eq!(report.fetched, 0);
    assert!(!f.store.get(stuck.event_id).await.unwrap().unwrap().published);
}

#[tokio::test(start_paused = true)]
async fn test_spawned_task_publishes_until_stopped() {
    let f = fixture(OutboxConfig {
        publish_interval_secs: 1,
        ..Default::default()
    })
    .await;
    stage(&f, "q-1", "Background", 0).await;

    let handle = f.publisher.clone().spawn();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(f.broker.published_count().await, 1);

    stage(&f, "q-2", "Later", 0).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(f.broker.published_count().await, 2);

    handle.shutdown().await;
    stage(&f, "q-3", "After stop", 0).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(f.broker.published_count().await, 2);
}
