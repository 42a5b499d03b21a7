//! crm-sync worker
//!
//! Consumes CRM domain events for one tenant from Redis Streams and applies
//! them to the projection store through the dispatch table.
//!
//! ## Configuration
//!
//! `config/crm-sync.toml` (or the file named by `CRM_SYNC_CONFIG`), plus:
//! - `REDIS_URL`: Redis connection string
//! - `CRM_SYNC_TENANT_ID`: Tenant served by this worker (required)
//! - `CRM_SYNC_INSTANCE_ID`: Consumer instance (default: hostname or UUID)
//! - `RUST_LOG`: Logging level (default: "info")

use std::sync::Arc;

use deadpool_redis::{Config, Runtime};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crm_sync::broker::RedisBroker;
use crm_sync::config::CrmSyncConfig;
use crm_sync::coordinator::ConsumerGroupCoordinator;
use crm_sync::dlq::DeadLetterQueue;
use crm_sync::engine::{EngineComponents, EngineError, StreamConsumer};
use crm_sync::handlers::DispatchTable;
use crm_sync::ledger::ProcessedLedger;
use crm_sync::metrics::MetricsRecorder;
use crm_sync::shutdown::ShutdownSignal;
use crm_sync::store::redis::DEFAULT_STORE_PREFIX;
use crm_sync::store::RedisStateStore;
use crm_sync::CircuitBreaker;

/// Instance name used when none is configured.
fn default_instance_id() -> String {
    if let Ok(hostname) = hostname::get() {
        if let Some(name) = hostname.to_str() {
            return name.to_string();
        }
    }

    uuid::Uuid::new_v4().to_string()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CrmSyncConfig::load()?;
    let engine_config = config.engine_config()?;
    let settings = config.coordinator_settings(&default_instance_id());

    info!(
        tenant_id = %engine_config.tenant_id,
        instance_id = %settings.instance_id,
        "crm-sync worker starting"
    );

    let pool = Config::from_url(config.redis.url.clone()).create_pool(Some(Runtime::Tokio1))?;
    let broker = Arc::new(RedisBroker::new(pool.clone()));
    let store = Arc::new(RedisStateStore::with_settings(
        pool,
        DEFAULT_STORE_PREFIX,
        config.ledger_ttl(),
    ));

    let streams = Arc::new(config.stream_table());
    let coordinator = Arc::new(ConsumerGroupCoordinator::new(broker.clone(), streams, settings));
    let dispatch = DispatchTable::standard(store);
    info!(
        handler_count = dispatch.handler_count(),
        event_types = ?dispatch.event_types(),
        "Dispatch table configured"
    );

    let shutdown = ShutdownSignal::with_timeout(engine_config.grace_period);
    let engine = Arc::new(StreamConsumer::new(
        engine_config,
        EngineComponents {
            broker: broker.clone(),
            coordinator,
            dispatch,
            dlq: DeadLetterQueue::new(broker.clone()),
            ledger: ProcessedLedger::with_settings(
                broker.clone(),
                &config.consumer.ledger_prefix,
                config.ledger_ttl(),
            ),
            broker_breaker: Arc::new(CircuitBreaker::new("redis", config.breaker.broker.clone())),
            store_breaker: Arc::new(CircuitBreaker::new("state-store", config.breaker.store.clone())),
            metrics: Arc::new(MetricsRecorder::new()),
            shutdown: shutdown.clone(),
        },
    ));

    let listener = shutdown.clone();
    tokio::spawn(async move { listener.wait().await });

    match engine.initialize().await {
        Ok(report) => info!(
            created = report.created.len(),
            existing = report.existing.len(),
            failed = report.failed.len(),
            "Consumer groups ready"
        ),
        Err(EngineError::ShutdownRequested) => {
            info!("Shutdown requested before the consumer started");
            return Ok(());
        }
        Err(e) => {
            error!(error = %e, "Stream consumer failed to initialize");
            engine.shutdown().await;
            return Err(e.into());
        }
    }

    let runner = engine.clone();
    let run = tokio::spawn(async move { runner.run().await });

    shutdown.cancelled().await;
    info!("Shutdown signal received, finishing current batch...");
    engine.shutdown().await;

    match run.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Stream consumer loop failed"),
        Err(e) => error!(error = %e, "Stream consumer task panicked"),
    }

    info!("Worker shutdown complete");
    Ok(())
}
