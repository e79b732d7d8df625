use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use metering_worker::{
    broker,
    config::AppConfig,
    metrics_server,
    observability,
    pipeline::MessageProcessor,
    sinks::{AmqpEventPublisher, PgReadingRepository},
    sources::IngestConsumer,
    transform::{AnomalyDetector, Validator},
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load().context("failed to load configuration")?;
    tracing::info!(
        service = %cfg.service_name,
        database = %broker::redact_url(&cfg.database.url),
        broker = %broker::redact_url(&cfg.rabbitmq.url),
        "starting metering worker"
    );

    if cfg.metrics.enabled {
        metrics_server::init(&cfg.metrics.bind_addr)?;
    }

    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&cfg.database.url)
        .await
        .with_context(|| format!("failed to connect to {}", broker::redact_url(&cfg.database.url)))?;

    let connection = broker::connect(&cfg.rabbitmq.url)
        .await
        .with_context(|| format!("failed to connect to {}", broker::redact_url(&cfg.rabbitmq.url)))?;

    let publisher = AmqpEventPublisher::new(
        &connection,
        &cfg.rabbitmq.worker_exchange,
        &cfg.rabbitmq.worker_routing_key,
    )
    .await
    .context("failed to set up event publisher")?;

    let processor = Arc::new(MessageProcessor::new(
        PgReadingRepository::new(pool.clone()),
        publisher.clone(),
        Validator::new(cfg.validation.timestamp_tolerance_minutes),
        AnomalyDetector::new(cfg.anomaly.spike_threshold, cfg.anomaly.min_data_points),
        cfg.anomaly.history_window,
    ));

    let consumer = IngestConsumer::declare(&connection, cfg.consumer_settings(), processor)
        .await
        .context("failed to declare ingest topology")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let outcome = consumer.run(shutdown).await;

    publisher.close().await;
    if let Err(e) = connection.close(200, "worker shutdown").await {
        tracing::warn!(error = %e, "failed to close broker connection");
    }
    pool.close().await;

    outcome.context("ingest consumer stopped with an error")?;
    tracing::info!("metering worker stopped");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
    shutdown.cancel();
}
