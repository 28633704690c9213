//! Full delivery loop against in-memory doubles:
//! aggregate -> outbox -> publisher -> broker -> consumer -> remote bus.
//!
//! Run with: cargo test --test end_to_end

mod common;

use std::sync::Arc;

use courier::broker::{BrokerAdapter, InMemoryBroker};
use courier::bus::{HandlerRegistry, LocalEventBus, RegisteredHandler};
use courier::consumer::EventConsumer;
use courier::dlq::DeadLetterQueue;
use courier::outbox::{InMemoryOutboxStore, OutboxConfig, OutboxStager, OutboxStore};
use courier::publisher::OutboxPublisher;
use courier::reliability::{ReliabilityExecutor, RetryPolicy};

use common::{BrokenHandler, ChannelHandler, Order, OrderPlaced, OrderShipped};

struct Harness {
    store: Arc<InMemoryOutboxStore>,
    broker: Arc<InMemoryBroker>,
    stager: OutboxStager,
    publisher: OutboxPublisher,
    remote_bus: Arc<LocalEventBus>,
}

async fn harness(remote_bus: LocalEventBus) -> Harness {
    let store = Arc::new(InMemoryOutboxStore::new(5));
    let broker = Arc::new(InMemoryBroker::new());
    broker.connect().await.unwrap();

    let local_bus = Arc::new(LocalEventBus::new(HandlerRegistry::new()));
    let stager = OutboxStager::new(local_bus, true);
    let publisher = OutboxPublisher::new(store.clone(), broker.clone(), OutboxConfig::default());

    let remote_bus = Arc::new(remote_bus);
    let consumer = EventConsumer::new(broker.clone(), common::registry(), remote_bus.clone());
    consumer.subscribe_all().await.unwrap();

    Harness {
        store,
        broker,
        stager,
        publisher,
        remote_bus,
    }
}

#[tokio::test]
async fn test_order_flows_from_outbox_to_remote_handler() {
    let h = harness(LocalEventBus::new(HandlerRegistry::new())).await;
    let (fulfilment, mut received) = ChannelHandler::new("fulfilment");
    h.remote_bus.register(fulfilment, "OrderPlaced").await;

    let mut order = Order::place("order-1", "c-7", 4_200);
    assert_eq!(h.stager.stage_into(h.store.as_ref(), &order).await.unwrap(), 1);
    h.stager.dispatch(&mut order).await;

    let staged = h.store.find_unpublished(10).await.unwrap();
    assert_eq!(staged.len(), 1);
    assert!(!staged[0].published);

    let report = h.publisher.tick().await.unwrap();
    assert_eq!(report.published, 1);

    let published = h.broker.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].event_type, "OrderPlaced");
    assert_eq!(published[0].aggregate_id, "order-1");
    assert!(h.store.get(staged[0].event_id).await.unwrap().unwrap().published);

    assert_eq!(h.broker.deliver_pending().await, 1);
    let event = received.recv().await.unwrap();
    assert_eq!(event.aggregate_id(), "order-1");
    assert_eq!(event.event_id(), staged[0].event_id);
    let placed = event.downcast_ref::<OrderPlaced>().unwrap();
    assert_eq!(placed.data().total_cents, 4_200);
    assert!(received.try_recv().is_err());
}

#[tokio::test]
async fn test_aggregate_events_arrive_in_order_after_outage() {
    let h = harness(LocalEventBus::new(HandlerRegistry::new())).await;
    let (audit, mut received) = ChannelHandler::new("audit");
    h.remote_bus.register(audit.clone(), "OrderPlaced").await;
    h.remote_bus.register(audit, "OrderShipped").await;

    let mut order = Order::place("order-2", "c-1", 100);
    order.ship("ups");
    assert_eq!(h.stager.stage_into(h.store.as_ref(), &order).await.unwrap(), 2);

    h.broker.set_fail_on_publish(true);
    let report = h.publisher.tick().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(h.broker.published_count().await, 0);

    h.broker.set_fail_on_publish(false);
    let report = h.publisher.tick().await.unwrap();
    assert_eq!(report.published, 2);
    assert_eq!(h.store.stats().await.unwrap().pending, 0);

    // Queues are per event type; ordering is checked on what the broker accepted.
    let types: Vec<_> = h
        .broker
        .published()
        .await
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types, vec!["OrderPlaced", "OrderShipped"]);

    assert_eq!(h.broker.deliver_pending().await, 2);
    let mut seen = vec![
        received.recv().await.unwrap().event_type().to_string(),
        received.recv().await.unwrap().event_type().to_string(),
    ];
    seen.sort();
    assert_eq!(seen, vec!["OrderPlaced", "OrderShipped"]);
}

#[tokio::test]
async fn test_remote_handler_failure_is_quarantined_not_redelivered() {
    let handlers = HandlerRegistry::new();
    let dead_letters = Arc::new(DeadLetterQueue::new());
    let executor = Arc::new(ReliabilityExecutor::new(handlers.clone(), dead_letters.clone()));
    let remote_bus = LocalEventBus::new(handlers).with_executor(executor);
    let h = harness(remote_bus).await;

    let (billing, mut received) = ChannelHandler::new("billing");
    h.remote_bus.register(billing, "OrderPlaced").await;
    h.remote_bus
        .register_with(
            "OrderPlaced",
            RegisteredHandler::new(Arc::new(BrokenHandler("loyalty")))
                .with_policy(RetryPolicy::no_retry()),
        )
        .await;

    let order = Order::place("order-3", "c-2", 990);
    h.stager.stage_into(h.store.as_ref(), &order).await.unwrap();
    h.publisher.tick().await.unwrap();
    h.broker.deliver_pending().await;

    assert_eq!(received.recv().await.unwrap().aggregate_id(), "order-3");

    let failed = dead_letters.list().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].handler_name, "loyalty");
    assert_eq!(failed[0].aggregate_id, "order-3");

    // Handler failures stay inside this process; the broker still acks.
    assert_eq!(h.broker.acked().await.len(), 1);
    assert!(h.broker.dead_lettered().await.is_empty());
}

#[tokio::test]
async fn test_unsupported_schema_version_goes_to_broker_dead_letter() {
    let h = harness(LocalEventBus::new(HandlerRegistry::new())).await;

    // A producer that knows a newer schema than this consumer.
    let mut envelope = courier::event::EventEnvelope::from_event(
        &courier::event::Event::new("order-4", OrderShipped { carrier: "dhl".into() }),
        "Order",
    )
    .unwrap();
    envelope.event_version = 99;
    h.broker.publish(&envelope).await.unwrap();

    assert_eq!(h.broker.deliver_pending().await, 1);
    assert!(h.broker.acked().await.is_empty());
    assert_eq!(h.broker.dead_lettered().await.len(), 1);
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_sqlite_outbox_commits_with_entity() {
    use courier::outbox::SqliteOutboxStore;
    use sqlx::sqlite::SqlitePoolOptions;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::query("CREATE TABLE orders (id TEXT PRIMARY KEY, total_cents INTEGER NOT NULL)")
        .execute(&pool)
        .await
        .unwrap();
    let store = Arc::new(SqliteOutboxStore::new(pool.clone(), 5));
    store.init().await.unwrap();

    let broker = Arc::new(InMemoryBroker::new());
    broker.connect().await.unwrap();
    let stager = OutboxStager::new(Arc::new(LocalEventBus::new(HandlerRegistry::new())), true);
    let publisher = OutboxPublisher::new(store.clone(), broker.clone(), OutboxConfig::default());

    let mut order = Order::place("order-5", "c-3", 1_500);
    order.ship("fedex");

    let mut tx = pool.begin().await.unwrap();
    sqlx::query("INSERT INTO orders (id, total_cents) VALUES ('order-5', 1500)")
        .execute(&mut *tx)
        .await
        .unwrap();
    assert_eq!(stager.stage(&mut *tx, &order).await.unwrap(), 2);
    tx.commit().await.unwrap();
    stager.dispatch(&mut order).await;

    let report = publisher.tick().await.unwrap();
    assert_eq!(report.published, 2);
    let published = broker.published().await;
    assert_eq!(published[0].event_type, "OrderPlaced");
    assert_eq!(published[1].event_type, "OrderShipped");
    assert_eq!(store.stats().await.unwrap().published, 2);
}
