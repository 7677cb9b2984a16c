//! One full recomputation pass over the stored windows
//!
//! load latest windows → load reference data → enrich → both engines →
//! combine → write derived tables. Every derived table is regenerated from
//! scratch; nothing is updated incrementally.

use anyhow::{Context, Result, bail};
use metrics::{counter, histogram};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

use crate::analysis::{AnalysisResult, AnomalySummary, analyze_states, enrich_states};
use crate::events::AircraftEvent;
use crate::reference::ReferenceData;
use crate::storage::WindowStore;
use crate::tables::AnalyticalStore;

pub const AIRCRAFT_STATES_TABLE: &str = "aircraft_states";
pub const ENRICHED_STATES_TABLE: &str = "enriched_aircraft_states";
pub const TYPE_PROFILES_TABLE: &str = "aircraft_type_profiles";
pub const ANOMALY_FEATURES_TABLE: &str = "anomaly_features";
pub const FLAGGED_ANOMALIES_TABLE: &str = "flagged_anomalies";

/// Inputs of an analysis pass
#[derive(Debug, Clone)]
pub struct PassSettings {
    pub history_windows: usize,
    pub airframes_path: PathBuf,
    pub models_path: PathBuf,
    pub output_dir: PathBuf,
}

/// What a completed pass loaded and produced
#[derive(Debug, Clone)]
pub struct PassReport {
    pub window_keys: Vec<String>,
    pub state_count: usize,
    pub profile_count: usize,
    pub summary: AnomalySummary,
}

/// Load the `history_windows` most recent batches, oldest first
pub async fn load_corpus(
    store: &dyn WindowStore,
    history_windows: usize,
) -> Result<(Vec<String>, Vec<AircraftEvent>)> {
    let keys = store.latest_window_keys(history_windows.max(1)).await?;
    if keys.is_empty() {
        bail!("No window batches found in {}", store.describe());
    }

    let mut events = Vec::new();
    for key in &keys {
        let batch = store
            .get_window(key)
            .await
            .context(format!("Failed to load window batch {}", key))?;
        info!("Loaded {} states from {}", batch.len(), key);
        events.extend(batch);
    }
    Ok((keys, events))
}

/// Run one pass; on any error the previous derived tables are left in place
pub async fn run_analysis_pass(
    store: &dyn WindowStore,
    settings: &PassSettings,
) -> Result<PassReport> {
    let start = Instant::now();
    let (window_keys, events) = load_corpus(store, settings.history_windows).await?;

    let settings = settings.clone();
    let report = tokio::task::spawn_blocking(move || -> Result<PassReport> {
        let reference = ReferenceData::load(&settings.airframes_path, &settings.models_path)?;
        let (states, join_stats) = enrich_states(&events, &reference);
        join_stats.log();

        let AnalysisResult {
            profiles,
            deltas,
            records,
            summary,
            ..
        } = analyze_states(&states);
        summary.log();

        let output = AnalyticalStore::new(&settings.output_dir);
        let mut staging = output.stage()?;
        staging.write_table(AIRCRAFT_STATES_TABLE, &events)?;
        staging.write_table(ENRICHED_STATES_TABLE, &states)?;
        staging.write_table(TYPE_PROFILES_TABLE, &profiles)?;
        staging.write_table(ANOMALY_FEATURES_TABLE, &deltas)?;
        staging.write_table(FLAGGED_ANOMALIES_TABLE, &records)?;
        staging.commit()?;

        Ok(PassReport {
            window_keys,
            state_count: states.len(),
            profile_count: profiles.len(),
            summary,
        })
    })
    .await??;

    counter!("analysis.passes_total").increment(1);
    histogram!("analysis.pass_duration_ms").record(start.elapsed().as_millis() as f64);
    info!(
        "Analysis pass complete in {:.1}s: {} states from {} windows, {} type profiles",
        start.elapsed().as_secs_f64(),
        report.state_count,
        report.window_keys.len(),
        report.profile_count
    );
    Ok(report)
}
