use anyhow::Result;
use metrics::counter;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use airops::config::PipelineConfig;
use airops::pipeline::{PassReport, PassSettings, run_analysis_pass};
use airops::storage::WindowStore;

use super::open_window_store;

fn pass_settings(config: &PipelineConfig) -> PassSettings {
    PassSettings {
        history_windows: config.analysis.history_windows,
        airframes_path: config.reference.airframes_path.clone(),
        models_path: config.reference.models_path.clone(),
        output_dir: config.analysis.output_dir.clone(),
    }
}

fn log_report(report: &PassReport) {
    info!(
        "Analyzed windows {}: {} of {} records flagged",
        report.window_keys.join(", "),
        report.summary.flagged_records,
        report.summary.total_records
    );
}

/// Handle the analyze command
///
/// Without an interval a single pass runs and its error is returned. With an
/// interval, failed passes are logged and the previous tables stay in place
/// until the next pass succeeds.
pub async fn handle_analyze(config: PipelineConfig) -> Result<()> {
    let store = open_window_store(&config.storage).await?;
    let settings = pass_settings(&config);
    info!(
        "Analyzing the latest {} windows from {} into {:?}",
        settings.history_windows,
        store.describe(),
        settings.output_dir
    );

    let Some(interval_secs) = config.analysis.interval_secs else {
        let report = run_analysis_pass(store.as_ref(), &settings).await?;
        log_report(&report);
        return Ok(());
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("Running an analysis pass every {}s", interval_secs);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_scheduled_pass(store.as_ref(), &settings).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping scheduled analysis");
                break;
            }
        }
    }
    Ok(())
}

async fn run_scheduled_pass(store: &dyn WindowStore, settings: &PassSettings) {
    match run_analysis_pass(store, settings).await {
        Ok(report) => log_report(&report),
        Err(e) => {
            counter!("analysis.failures_total").increment(1);
            error!("Analysis pass failed, keeping previous tables: {:#}", e);
        }
    }
}
