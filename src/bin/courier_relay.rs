//! courier-relay: outbox relay service
//!
//! Drains the SQLite outbox into the configured broker, sweeps expired
//! published rows and serves the admin API.
//!
//! ## Architecture
//! ```text
//! [Application] --tx--> [SQLite outbox] -> [courier-relay] -> [Broker]
//!                                                |
//!                                                v
//!                                      [Admin API :8088/admin/events]
//! ```
//!
//! ## Configuration
//! - `--config <path>` / COURIER_CONFIG: YAML configuration file
//! - COURIER__<SECTION>__<KEY>: per-key overrides
//! - COURIER_LOG: log filter (default: info)
//! - messaging.type must be `amqp` (e.g. COURIER__MESSAGING__TYPE=amqp)

use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::{error, info, warn};

use courier::admin::{self, AdminState};
use courier::broker::BrokerAdapter;
use courier::bus::HandlerRegistry;
use courier::circuit::CircuitBreakerRegistry;
use courier::config::{Config, MessagingType};
use courier::dlq::DeadLetterQueue;
use courier::monitoring::EventMonitor;
use courier::outbox::SqliteOutboxStore;
use courier::publisher::OutboxPublisher;
use courier::reliability::ReliabilityExecutor;
use courier::utils::bootstrap::{
    connect_with_retry, init_tracing, parse_config_path, shutdown_signal,
};

const BROKER_CONNECT_RETRIES: u32 = 30;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    if !config.outbox.is_enabled() {
        warn!("Outbox disabled; relay will publish whatever rows already exist");
    }

    let store = Arc::new(open_outbox(&config).await?);
    let broker = build_broker(&config)?;

    connect_with_retry("broker", BROKER_CONNECT_RETRIES, || broker.connect()).await?;

    let publisher = Arc::new(OutboxPublisher::new(
        store,
        broker.clone(),
        config.outbox.clone(),
    ));
    let publisher_task = publisher.clone().spawn();

    let monitor = Arc::new(EventMonitor::new(config.monitoring.clone()));
    let breakers = Arc::new(
        CircuitBreakerRegistry::new(config.circuit_breaker.clone()).with_observer(monitor.clone()),
    );
    let dead_letters = Arc::new(DeadLetterQueue::new());
    let executor = Arc::new(
        ReliabilityExecutor::new(
            HandlerRegistry::new().with_default_policy(config.reliability.clone()),
            dead_letters.clone(),
        )
            .with_circuit_breakers(breakers.clone())
            .with_observer(monitor.clone()),
    );

    let admin_task = if config.admin.enabled {
        let state = AdminState::new(monitor, breakers, dead_letters)
            .with_executor(executor.clone())
            .with_publisher(publisher)
            .with_broker(broker.clone());
        let port = config.admin.port;
        Some(tokio::spawn(async move {
            if let Err(e) = admin::serve(state, port, shutdown_signal()).await {
                error!(error = %e, "admin server failed");
            }
        }))
    } else {
        None
    };

    info!(
        messaging = ?config.messaging.messaging_type,
        storage = %config.storage.path,
        "courier-relay running, press Ctrl+C to exit"
    );
    shutdown_signal().await;

    publisher_task.shutdown().await;
    executor.shutdown();
    if let Some(task) = admin_task {
        if let Err(e) = task.await {
            error!(error = %e, "admin task panicked");
        }
    }
    broker.close().await?;
    info!("courier-relay stopped");
    Ok(())
}

async fn open_outbox(config: &Config) -> Result<SqliteOutboxStore, BoxError> {
    if let Some(dir) = std::path::Path::new(&config.storage.path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }

    let opts = SqliteConnectOptions::new()
        .filename(&config.storage.path)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30))
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.storage.max_connections)
        .connect_with(opts)
        .await?;

    let store = SqliteOutboxStore::new(pool, config.outbox.max_attempts);
    store.init().await?;
    info!(path = %config.storage.path, "outbox store ready");
    Ok(store)
}

fn build_broker(config: &Config) -> Result<Arc<dyn BrokerAdapter>, BoxError> {
    match config.messaging.messaging_type {
        // Nothing outside this process can consume an in-memory broker.
        MessagingType::Memory => Err(
            "courier-relay needs an external broker; set messaging.type to amqp".into(),
        ),
        #[cfg(feature = "amqp")]
        MessagingType::Amqp => Ok(Arc::new(courier::broker::AmqpBroker::new(
            config.messaging.amqp.clone(),
        )?)),
        #[cfg(not(feature = "amqp"))]
        MessagingType::Amqp => Err("courier-relay was built without the amqp feature".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_broker_is_refused() {
        let config = Config::default();
        assert_eq!(config.messaging.messaging_type, MessagingType::Memory);

        let err = build_broker(&config).err().unwrap();
        assert!(err.to_string().contains("external broker"));
    }

    #[cfg(feature = "amqp")]
    #[test]
    fn test_amqp_broker_is_built_from_config() {
        use courier::config::MessagingConfig;

        let config = Config {
            messaging: MessagingConfig {
                messaging_type: MessagingType::Amqp,
                ..Default::default()
            },
            ..Default::default()
        };

        let broker = build_broker(&config).unwrap();
        assert!(!broker.is_connected());
    }
}
