//! Anomaly analysis over the stored window corpus
//!
//! Two independent strategies run over the same enriched corpus:
//! - [`deltas`]: per-aircraft changes between consecutive samples
//! - [`baseline`]: per-type population statistics
//!
//! [`combiner`] merges both into one flag record per observation.

pub mod baseline;
pub mod combiner;
pub mod deltas;
pub mod enrich;
pub mod stats;

pub use baseline::{AircraftTypeProfile, BaselineFeatures, BaselineOutput, run_baseline_engine};
pub use combiner::{AnomalyRecord, AnomalySummary, combine};
pub use deltas::{DeltaFeatures, compute_deltas};
pub use enrich::{EnrichedState, JoinStats, RowId, enrich_states};

/// Everything one analysis pass derives from an enriched corpus
#[derive(Debug, Clone, Default)]
pub struct AnalysisResult {
    pub profiles: Vec<AircraftTypeProfile>,
    pub deltas: Vec<DeltaFeatures>,
    pub baselines: Vec<BaselineFeatures>,
    pub records: Vec<AnomalyRecord>,
    pub summary: AnomalySummary,
}

/// Run both engines in parallel and combine their output
pub fn analyze_states(states: &[EnrichedState]) -> AnalysisResult {
    let (deltas, baseline) = rayon::join(|| compute_deltas(states), || run_baseline_engine(states));
    let records = combine(&deltas, &baseline.features);
    let summary = AnomalySummary::from_records(&records);

    AnalysisResult {
        profiles: baseline.profiles,
        deltas,
        baselines: baseline.features,
        records,
        summary,
    }
}
