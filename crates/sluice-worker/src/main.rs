mod config;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use sluice_client::HttpTransport;
use sluice_core::{
    AdaptiveThrottleController, EnvelopeProcessor, ExternalCallGateway, MultiRegionLimiterPool,
    QueueConsumer, QueueMessageHandler, ThrottleConfig, TracingConsumerReporter,
};
use sluice_db::{Database, DatabaseConfig};

use crate::config::WorkerSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sluice=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let settings = WorkerSettings::from_env()?;

    // Everything that can fail on configuration fails here, before any
    // message is received.
    let db = Database::connect(&DatabaseConfig::from_env()?).await?;
    db.migrate().await?;

    let handler = QueueMessageHandler::connect(
        db.queue(&settings.queue),
        db.queue(&settings.poison_queue),
        settings.handler.clone(),
    )
    .await
    .context("failed to open queues")?;

    let transport = HttpTransport::from_env(&settings.regions)?;
    let pool = MultiRegionLimiterPool::new(&settings.regions, &settings.limiter)?;
    let gateway = ExternalCallGateway::new(
        transport,
        settings.regions.clone(),
        pool,
        settings.gateway.clone(),
    )?;

    let throttle = AdaptiveThrottleController::new(db.metrics_store(), ThrottleConfig::default())?;
    throttle.restore(&settings.known_sources).await;

    let consumer = QueueConsumer::new(
        handler,
        EnvelopeProcessor::new(gateway, throttle),
        settings.consumer.clone(),
    )?;

    tracing::info!(
        queue = %settings.queue,
        poison_queue = %settings.poison_queue,
        regions = settings.regions.len(),
        "Worker ready"
    );

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal.cancel();
    });

    let totals = consumer.run(cancel, &TracingConsumerReporter).await;

    let stats = consumer.processor().gateway().stats();
    tracing::info!(
        calls = stats.total_calls,
        failed_calls = stats.failed_calls,
        cost = stats.total_cost,
        "Gateway usage"
    );
    db.close().await;

    let totals = totals?;
    tracing::info!(
        processed = totals.processed,
        quarantined = totals.quarantined,
        "Worker stopped"
    );
    Ok(())
}
