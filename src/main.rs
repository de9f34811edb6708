use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dlq_drain::config::Config;
use dlq_drain::consumer::DlqConsumer;
use dlq_drain::drain;
use dlq_drain::event::EventLogger;
use dlq_drain::shutdown;

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::from_env().context("load drain config")?;
    info!(
        brokers = %config.kafka_brokers,
        group = %config.kafka_group_id,
        topics = %config.kafka_topics.join(","),
        "starting dead-letter drain"
    );

    let consumer = DlqConsumer::connect(&config)
        .await
        .context("connect dead-letter consumer")?;

    let (shutdown_token, shutdown_handle) = shutdown::listen();

    // A failed run is logged rather than bubbled: the consumer still gets
    // closed below and a rerun resumes from the last committed offsets.
    match drain::drain(&consumer, &EventLogger, &shutdown_token).await {
        Ok(report) => {
            info!(
                outcome = ?report.outcome,
                records_drained = report.records_drained,
                cycles = report.cycles,
                "drain task finished"
            );
        }
        Err(error) => {
            error!(error = ?error, "drain task failed");
        }
    }

    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }

    drop(consumer);
    info!("consumer closed, exiting");

    Ok(())
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
