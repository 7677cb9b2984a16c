use anyhow::{Context, Result};
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::info;

/// Install the Prometheus recorder
/// Returns a handle that renders the current metrics for scraping
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        // Buckets: 1ms .. 60s, covering both single uploads and full analysis passes
        .set_buckets_for_metric(
            Matcher::Suffix("duration_ms".to_string()),
            &[
                1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 15000.0, 60000.0,
            ],
        )
        .context("Failed to set buckets for duration histograms")?
        .set_buckets_for_metric(
            Matcher::Full("windows.events_per_window".to_string()),
            &[10.0, 100.0, 1000.0, 5000.0, 10000.0, 50000.0, 100000.0],
        )
        .context("Failed to set buckets for windows.events_per_window")?
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

/// Background task to update process metrics
/// Updates uptime and memory usage metrics every 5 seconds
pub async fn process_metrics_task() {
    let start_time = Instant::now();

    loop {
        metrics::gauge!("process.uptime.seconds").set(start_time.elapsed().as_secs() as f64);
        metrics::gauge!("process.is_up").set(1.0);

        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status")
                && let Some(line) = status.lines().find(|l| l.starts_with("VmRSS:"))
                && let Some(kb_str) = line.split_whitespace().nth(1)
                && let Ok(kb) = kb_str.parse::<f64>()
            {
                metrics::gauge!("process.memory.bytes").set(kb * 1024.0);
            }
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Initialize consumer metrics to zero so they appear in Prometheus before any event
pub fn initialize_consumer_metrics() {
    metrics::counter!("ingest.events_total").absolute(0);
    metrics::counter!("ingest.malformed_total").absolute(0);

    metrics::counter!("windows.events_admitted_total").absolute(0);
    metrics::counter!("windows.late_dropped_total").absolute(0);
    metrics::counter!("windows.unassignable_total").absolute(0);
    metrics::counter!("windows.emitted_total").absolute(0);
    metrics::gauge!("windows.in_flight").set(0.0);

    metrics::counter!("window_writer.windows_stored_total").absolute(0);
    metrics::counter!("window_writer.retries_total").absolute(0);
    metrics::counter!("window_writer.backpressure_total").absolute(0);
    metrics::counter!("window_writer.errors_total").absolute(0);
    metrics::gauge!("window_writer.queue_depth").set(0.0);
}

/// Initialize analysis metrics to zero so they appear in Prometheus before the first pass
pub fn initialize_analysis_metrics() {
    metrics::counter!("analysis.passes_total").absolute(0);
    metrics::counter!("analysis.failures_total").absolute(0);
}

/// Serve `/metrics` on the given port until the process exits
///
/// The recorder must already be installed with [`init_metrics`].
pub async fn start_metrics_server(handle: PrometheusHandle, port: u16) -> Result<()> {
    tokio::spawn(process_metrics_task());

    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting metrics server on http://{}/metrics", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind metrics server to {}", addr))?;

    axum::serve(listener, app)
        .await
        .context("Metrics server failed")
}
