//! Merge delta and baseline results into one record per observation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use super::baseline::BaselineFeatures;
use super::deltas::DeltaFeatures;
use super::enrich::RowId;
use crate::events::lenient_timestamp;

/// Unified anomaly flags for one observation
///
/// Flags from an engine that did not evaluate the observation are false and
/// its feature columns are empty; `has_delta` / `has_baseline` say which
/// engines contributed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub row_id: RowId,
    pub icao24: String,
    #[serde(default, with = "lenient_timestamp")]
    pub time_position: Option<DateTime<Utc>>,
    pub type_designator: Option<String>,
    pub velocity: Option<f64>,
    pub baro_altitude: Option<f64>,
    pub vertical_rate: Option<f64>,
    pub has_delta: bool,
    pub has_baseline: bool,

    pub velocity_delta: Option<f64>,
    pub altitude_delta: Option<f64>,
    pub time_delta: Option<f64>,
    pub climb_rate: Option<f64>,
    pub velocity_zscore: Option<f64>,
    pub altitude_zscore: Option<f64>,
    pub velocity_p95_ratio: Option<f64>,
    pub altitude_p95_ratio: Option<f64>,

    pub sudden_velocity: bool,
    pub unrealistic_climb: bool,
    pub altitude_jump: bool,
    pub high_speed: bool,
    pub low_speed: bool,
    pub high_altitude: bool,
    pub low_altitude: bool,
    pub extreme_speed: bool,
    pub extreme_altitude: bool,
    pub unusual_vertical_rate: bool,
}

impl AnomalyRecord {
    fn merge_delta(&mut self, delta: &DeltaFeatures) {
        self.icao24.clone_from(&delta.icao24);
        self.time_position = delta.time_position;
        self.velocity = delta.velocity;
        self.baro_altitude = delta.baro_altitude;
        self.vertical_rate = delta.vertical_rate;
        self.has_delta = true;
        self.velocity_delta = delta.velocity_delta;
        self.altitude_delta = delta.altitude_delta;
        self.time_delta = Some(delta.time_delta);
        self.climb_rate = delta.climb_rate;
        self.sudden_velocity = delta.sudden_velocity;
        self.unrealistic_climb = delta.unrealistic_climb;
        self.altitude_jump = delta.altitude_jump;
    }

    fn merge_baseline(&mut self, baseline: &BaselineFeatures) {
        if !self.has_delta {
            self.icao24.clone_from(&baseline.icao24);
            self.time_position = baseline.time_position;
            self.velocity = baseline.velocity;
            self.baro_altitude = baseline.baro_altitude;
            self.vertical_rate = baseline.vertical_rate;
        }
        self.type_designator = Some(baseline.type_designator.clone());
        self.has_baseline = true;
        self.velocity_zscore = baseline.velocity_zscore;
        self.altitude_zscore = baseline.altitude_zscore;
        self.velocity_p95_ratio = baseline.velocity_p95_ratio;
        self.altitude_p95_ratio = baseline.altitude_p95_ratio;
        self.high_speed = baseline.high_speed;
        self.low_speed = baseline.low_speed;
        self.high_altitude = baseline.high_altitude;
        self.low_altitude = baseline.low_altitude;
        self.extreme_speed = baseline.extreme_speed;
        self.extreme_altitude = baseline.extreme_altitude;
        self.unusual_vertical_rate = baseline.unusual_vertical_rate;
    }

    pub fn any_flag(&self) -> bool {
        self.flags().iter().any(|(_, set)| *set)
    }

    /// Every flag with its column name, in output order
    pub fn flags(&self) -> [(&'static str, bool); 10] {
        [
            ("sudden_velocity", self.sudden_velocity),
            ("unrealistic_climb", self.unrealistic_climb),
            ("altitude_jump", self.altitude_jump),
            ("high_speed", self.high_speed),
            ("low_speed", self.low_speed),
            ("high_altitude", self.high_altitude),
            ("low_altitude", self.low_altitude),
            ("extreme_speed", self.extreme_speed),
            ("extreme_altitude", self.extreme_altitude),
            ("unusual_vertical_rate", self.unusual_vertical_rate),
        ]
    }
}

/// Outer union of both engines keyed by row id, ordered by row id
///
/// A pure function of its inputs: the same inputs always produce the same
/// records in the same order.
pub fn combine(deltas: &[DeltaFeatures], baselines: &[BaselineFeatures]) -> Vec<AnomalyRecord> {
    let mut records: BTreeMap<RowId, AnomalyRecord> = BTreeMap::new();

    for delta in deltas {
        records
            .entry(delta.row_id)
            .or_insert_with(|| AnomalyRecord {
                row_id: delta.row_id,
                ..Default::default()
            })
            .merge_delta(delta);
    }
    for baseline in baselines {
        let record = records.entry(baseline.row_id).or_insert_with(|| AnomalyRecord {
            row_id: baseline.row_id,
            ..Default::default()
        });
        record.merge_baseline(baseline);
    }

    records.into_values().collect()
}

/// Per-flag counts over a combined result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnomalySummary {
    pub total_records: usize,
    pub flagged_records: usize,
    pub with_delta: usize,
    pub with_baseline: usize,
    pub flag_counts: BTreeMap<&'static str, usize>,
}

impl AnomalySummary {
    pub fn from_records(records: &[AnomalyRecord]) -> Self {
        let mut summary = Self {
            total_records: records.len(),
            ..Default::default()
        };
        for record in records {
            if record.any_flag() {
                summary.flagged_records += 1;
            }
            if record.has_delta {
                summary.with_delta += 1;
            }
            if record.has_baseline {
                summary.with_baseline += 1;
            }
            for (name, set) in record.flags() {
                let count = summary.flag_counts.entry(name).or_insert(0);
                if set {
                    *count += 1;
                }
            }
        }
        summary
    }

    pub fn count(&self, flag: &str) -> usize {
        self.flag_counts.get(flag).copied().unwrap_or(0)
    }

    pub fn log(&self) {
        info!(
            "Anomaly counts over {} observations ({} flagged, {} with deltas, {} with baselines):",
            self.total_records, self.flagged_records, self.with_delta, self.with_baseline
        );
        for (name, count) in &self.flag_counts {
            info!("  - {}: {}", name, count);
            metrics::gauge!("analysis.flagged", "flag" => *name).set(*count as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::baseline::run_baseline_engine;
    use crate::analysis::deltas::compute_deltas;
    use crate::analysis::enrich::EnrichedState;
    use crate::analysis::test_support::{state, typed_state};

    #[test]
    fn test_outer_union_keeps_rows_from_either_engine() {
        // Row 0 and 1: same aircraft, so row 1 gets a delta. Rows 2..12 form a baseline group.
        let mut states = vec![
            state(0, "abc123", Some(0), Some(100.0), Some(1000.0)),
            state(1, "abc123", Some(10), Some(170.0), Some(1000.0)),
        ];
        for i in 2..12 {
            states.push(typed_state(i, "B738", Some(200.0), Some(10_000.0)));
        }

        let deltas = compute_deltas(&states);
        let baselines = run_baseline_engine(&states).features;
        let records = combine(&deltas, &baselines);

        assert_eq!(records.len(), 11);
        assert_eq!(records[0].row_id, 1);
        assert!(records[0].has_delta);
        assert!(!records[0].has_baseline);
        assert!(records[0].sudden_velocity);
        assert!(records[1..].iter().all(|r| r.has_baseline && !r.has_delta));
        assert!(records.windows(2).all(|w| w[0].row_id < w[1].row_id));
    }

    #[test]
    fn test_flags_from_both_engines_merge_on_one_row() {
        let mut states: Vec<EnrichedState> = (0..10)
            .map(|i| typed_state(i, "C172", Some(60.0 + i as f64), Some(1000.0)))
            .collect();
        for (i, s) in states.iter_mut().enumerate() {
            s.icao24 = format!("c172{:02}", i);
        }
        // Give row 9 a predecessor that makes it jump
        let mut before = typed_state(10, "C172", None, Some(-500.0));
        before.icao24 = "c17209".into();
        before.typecode = None;
        before.icaoaircrafttype = None;
        before.time_position = states[9].time_position.map(|t| t - chrono::Duration::seconds(5));
        states.push(before);

        let deltas = compute_deltas(&states);
        let baselines = run_baseline_engine(&states).features;
        let records = combine(&deltas, &baselines);

        let row = records.iter().find(|r| r.row_id == 9).unwrap();
        assert!(row.has_delta && row.has_baseline);
        assert!(row.altitude_jump);
        assert_eq!(row.type_designator.as_deref(), Some("C172"));
        assert!(!row.high_speed);
    }

    #[test]
    fn test_summary_counts_every_flag() {
        let records = vec![
            AnomalyRecord {
                row_id: 0,
                sudden_velocity: true,
                high_speed: true,
                has_delta: true,
                has_baseline: true,
                ..Default::default()
            },
            AnomalyRecord {
                row_id: 1,
                has_baseline: true,
                ..Default::default()
            },
        ];
        let summary = AnomalySummary::from_records(&records);
        assert_eq!(summary.total_records, 2);
        assert_eq!(summary.flagged_records, 1);
        assert_eq!(summary.with_baseline, 2);
        assert_eq!(summary.count("sudden_velocity"), 1);
        assert_eq!(summary.count("high_speed"), 1);
        assert_eq!(summary.count("low_altitude"), 0);
        assert_eq!(summary.flag_counts.len(), 10);
    }
}
