use anyhow::{Result, bail};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use airops::config::PipelineConfig;
use airops::consumer::{ConsumeReport, Consumer};
use airops::event_sources::{EventSource, JsonLinesSource, NatsEventSource};
use airops::window::{PipelineClock, WindowAggregator};

use super::open_window_store;

/// Where the consumer reads aircraft states from
#[derive(Debug, Clone)]
pub enum ConsumeSource {
    Nats,
    File(PathBuf),
    Stdin,
}

/// Handle the consume command
///
/// Runs until the source ends or Ctrl+C is received. Closed windows are
/// written to the configured window store.
pub async fn handle_consume(config: PipelineConfig, source: ConsumeSource) -> Result<()> {
    let window = &config.window;
    info!(
        "Starting consumer: {}s windows, {}s grace, {:?} clock, {} storage",
        window.duration_secs, window.grace_secs, window.clock, config.storage.backend
    );

    let events: Box<dyn EventSource> = match source {
        ConsumeSource::Nats => Box::new(
            NatsEventSource::connect(
                &config.ingest.nats_url,
                &config.ingest.subject,
                &config.ingest.client_name,
            )
            .await?,
        ),
        ConsumeSource::File(path) => Box::new(JsonLinesSource::from_file(path).await?),
        ConsumeSource::Stdin => Box::new(JsonLinesSource::stdin()),
    };

    let store = open_window_store(&config.storage).await?;
    info!("Persisting closed windows to {}", store.describe());

    let aggregator = Arc::new(WindowAggregator::new(window.assignor()?, window.grace()?));
    let clock = Arc::new(PipelineClock::new(window.clock));
    let consumer = Consumer::new(aggregator, clock, Duration::from_millis(window.tick_millis));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let ConsumeReport {
        writer,
        late_dropped,
        ..
    } = consumer.run(events, store, shutdown).await?;

    if writer.windows_failed > 0 {
        bail!(
            "{} windows could not be persisted ({} stored)",
            writer.windows_failed,
            writer.windows_stored
        );
    }
    info!(
        "Consume finished: {} windows stored, {} late events dropped",
        writer.windows_stored, late_dropped
    );
    Ok(())
}
