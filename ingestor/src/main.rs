use axum::{http::StatusCode, routing::get, Router};
use occupancy_ingestor::batching::{self, BatcherConfig};
use occupancy_ingestor::config::Config;
use occupancy_ingestor::db::{make_pool, PgCounterStore};
use occupancy_ingestor::memory::MemoryStore;
use occupancy_ingestor::processor::BatchProcessor;
use occupancy_ingestor::publisher::{Hub, LivePublisher};
use occupancy_ingestor::registry::SensorRegistry;
use occupancy_ingestor::service::CounterService;
use occupancy_ingestor::store::CounterStore;
use occupancy_ingestor::{live, metrics, mqtt, rest, tasks};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();

    info!("Starting occupancy ingestor");
    info!("MQTT broker: {}:{}", config.mqtt.broker, config.mqtt.port);
    info!("HTTP server: {}", config.http_addr);

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
        std::process::exit(1);
    }

    let store: Arc<dyn CounterStore> = match &config.database_url {
        Some(url) => {
            info!("Database: {}", url.split('@').last().unwrap_or("***"));
            match make_pool(url).await {
                Ok(pool) => Arc::new(PgCounterStore::new(pool)),
                Err(e) => {
                    error!("Failed to connect to database: {}", e);
                    std::process::exit(1);
                }
            }
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let hub = Arc::new(Hub::new(config.live_channel_capacity));
    let publisher = Arc::new(LivePublisher::new(hub.clone(), config.fanout_deadline));
    let registry = Arc::new(SensorRegistry::new(config.offline_after));
    let service = Arc::new(CounterService::new(
        store.clone(),
        publisher.clone(),
        registry.clone(),
    ));
    let processor = Arc::new(BatchProcessor::new(store.clone(), publisher, registry.clone()));

    let shutdown = CancellationToken::new();

    let (ingest, batcher) = batching::channel(BatcherConfig::from(&config));
    let batcher_handle = tokio::spawn(batcher.run(processor, shutdown.child_token()));

    let client_id = format!("{}{}", config.mqtt.client_prefix, uuid::Uuid::new_v4());
    let mqtt_settings = config.mqtt.clone();
    let mqtt_shutdown = shutdown.child_token();
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::run_mqtt(mqtt_settings, client_id, ingest, mqtt_shutdown).await {
            error!("MQTT task failed: {}", e);
        }
    });

    let retention_handle = tasks::spawn_retention(
        store,
        config.retention_months,
        config.retention_sweep,
        shutdown.child_token(),
    );
    let liveness_handle =
        tasks::spawn_liveness_sweep(registry, config.liveness_sweep, shutdown.child_token());

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(service))
        .merge(live::router(hub));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_shutdown = shutdown.child_token();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
            .unwrap_or_else(|e| {
                error!("HTTP server error: {}", e);
            });
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
    shutdown.cancel();

    // MQTT first so nothing new is enqueued while the batcher winds down.
    let _ = mqtt_handle.await;
    match batcher_handle.await {
        Ok(summary) => info!(
            batches = summary.batches,
            dropped = summary.dropped,
            "Batcher finished"
        ),
        Err(e) => error!("Batcher task failed: {}", e),
    }
    let _ = tokio::join!(retention_handle, liveness_handle, server_handle);

    info!("Shutting down");
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    metrics::gather_metrics().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
