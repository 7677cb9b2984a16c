//! Sequential delta engine
//!
//! Each aircraft's states are ordered by `time_position` and every state is
//! compared with its immediate predecessor. Large changes over short
//! intervals are physically implausible for civil aircraft and usually point
//! at transponder or multilateration glitches.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use super::enrich::{EnrichedState, RowId};
use crate::events::lenient_timestamp;

/// m/s; roughly 2.5 g sustained over the interval below
pub const SUDDEN_VELOCITY_DELTA: f64 = 50.0;
pub const SUDDEN_VELOCITY_MAX_INTERVAL_SECS: f64 = 20.0;
/// m/s; about 10,000 ft/min
pub const UNREALISTIC_CLIMB_RATE: f64 = 50.0;
/// meters
pub const ALTITUDE_JUMP_DELTA: f64 = 1000.0;
pub const ALTITUDE_JUMP_MAX_INTERVAL_SECS: f64 = 10.0;

/// Delta features and flags for one state that has a predecessor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaFeatures {
    pub row_id: RowId,
    pub icao24: String,
    #[serde(with = "lenient_timestamp")]
    pub time_position: Option<DateTime<Utc>>,
    #[serde(with = "lenient_timestamp")]
    pub prev_time_position: Option<DateTime<Utc>>,
    pub velocity: Option<f64>,
    pub prev_velocity: Option<f64>,
    pub baro_altitude: Option<f64>,
    pub prev_altitude: Option<f64>,
    pub vertical_rate: Option<f64>,
    pub prev_vertical_rate: Option<f64>,
    pub velocity_delta: Option<f64>,
    pub altitude_delta: Option<f64>,
    /// Seconds since the predecessor
    pub time_delta: f64,
    /// altitude_delta / time_delta, `None` when time_delta is not positive
    pub climb_rate: Option<f64>,
    pub sudden_velocity: bool,
    pub unrealistic_climb: bool,
    pub altitude_jump: bool,
}

impl DeltaFeatures {
    fn between(previous: &EnrichedState, current: &EnrichedState) -> Option<Self> {
        let time = current.time_position?;
        let prev_time = previous.time_position?;

        let velocity_delta = diff(current.velocity, previous.velocity);
        let altitude_delta = diff(current.baro_altitude, previous.baro_altitude);
        let time_delta = (time - prev_time).num_milliseconds() as f64 / 1000.0;
        let climb_rate = if time_delta > 0.0 {
            altitude_delta.map(|delta| delta / time_delta)
        } else {
            None
        };

        Some(Self {
            row_id: current.row_id,
            icao24: current.icao24.clone(),
            time_position: Some(time),
            prev_time_position: Some(prev_time),
            velocity: current.velocity,
            prev_velocity: previous.velocity,
            baro_altitude: current.baro_altitude,
            prev_altitude: previous.baro_altitude,
            vertical_rate: current.vertical_rate,
            prev_vertical_rate: previous.vertical_rate,
            velocity_delta,
            altitude_delta,
            time_delta,
            climb_rate,
            sudden_velocity: velocity_delta.is_some_and(|d| d.abs() > SUDDEN_VELOCITY_DELTA)
                && time_delta < SUDDEN_VELOCITY_MAX_INTERVAL_SECS,
            unrealistic_climb: climb_rate.is_some_and(|rate| rate.abs() > UNREALISTIC_CLIMB_RATE),
            altitude_jump: altitude_delta.is_some_and(|d| d.abs() > ALTITUDE_JUMP_DELTA)
                && time_delta < ALTITUDE_JUMP_MAX_INTERVAL_SECS,
        })
    }

    pub fn any_flag(&self) -> bool {
        self.sudden_velocity || self.unrealistic_climb || self.altitude_jump
    }
}

fn diff(current: Option<f64>, previous: Option<f64>) -> Option<f64> {
    Some(current? - previous?)
}

/// Compute deltas for every state with a timed predecessor of the same aircraft
///
/// States without `time_position` are excluded entirely. Ties on time are
/// ordered by row id. Output is sorted by row id.
pub fn compute_deltas(states: &[EnrichedState]) -> Vec<DeltaFeatures> {
    let mut partitions: HashMap<&str, Vec<&EnrichedState>> = HashMap::new();
    for state in states.iter().filter(|s| s.time_position.is_some()) {
        partitions
            .entry(state.icao24.as_str())
            .or_default()
            .push(state);
    }

    let mut features: Vec<DeltaFeatures> = partitions
        .into_par_iter()
        .flat_map_iter(|(_, mut partition)| {
            partition.sort_by_key(|s| (s.time_position, s.row_id));
            partition
                .windows(2)
                .filter_map(|pair| DeltaFeatures::between(pair[0], pair[1]))
                .collect::<Vec<_>>()
        })
        .collect();
    features.sort_by_key(|f| f.row_id);

    info!(
        "Computed sequential deltas for {} of {} states ({} flagged)",
        features.len(),
        states.len(),
        features.iter().filter(|f| f.any_flag()).count()
    );
    features
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::test_support::state;

    #[test]
    fn test_first_state_has_no_delta() {
        let states = vec![state(0, "abc123", Some(0), Some(100.0), Some(1000.0))];
        assert!(compute_deltas(&states).is_empty());
    }

    #[test]
    fn test_sudden_velocity_requires_short_interval() {
        let fast = vec![
            state(0, "abc123", Some(0), Some(100.0), Some(1000.0)),
            state(1, "abc123", Some(15), Some(160.0), Some(1000.0)),
        ];
        let features = compute_deltas(&fast);
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].velocity_delta, Some(60.0));
        assert_eq!(features[0].time_delta, 15.0);
        assert!(features[0].sudden_velocity);

        let slow = vec![
            state(0, "abc123", Some(0), Some(100.0), Some(1000.0)),
            state(1, "abc123", Some(25), Some(160.0), Some(1000.0)),
        ];
        assert!(!compute_deltas(&slow)[0].sudden_velocity);
    }

    #[test]
    fn test_altitude_jump_and_climb_rate() {
        let states = vec![
            state(0, "abc123", Some(0), Some(200.0), Some(5000.0)),
            state(1, "abc123", Some(8), Some(200.0), Some(6200.0)),
        ];
        let features = compute_deltas(&states);
        assert_eq!(features[0].altitude_delta, Some(1200.0));
        assert!(features[0].altitude_jump);
        assert_eq!(features[0].climb_rate, Some(150.0));
        assert!(features[0].unrealistic_climb);
        assert!(!features[0].sudden_velocity);
    }

    #[test]
    fn test_steep_climb_over_ten_seconds_is_not_a_jump() {
        let states = vec![
            state(0, "abc123", Some(0), Some(200.0), Some(5000.0)),
            state(1, "abc123", Some(10), Some(200.0), Some(5600.0)),
        ];
        let features = compute_deltas(&states);
        assert_eq!(features[0].climb_rate, Some(60.0));
        assert!(features[0].unrealistic_climb);
        assert!(!features[0].altitude_jump);
        assert!(!features[0].sudden_velocity);
    }

    #[test]
    fn test_zero_time_delta_yields_null_climb_rate() {
        let states = vec![
            state(0, "abc123", Some(60), Some(200.0), Some(5000.0)),
            state(1, "abc123", Some(60), Some(200.0), Some(9000.0)),
        ];
        let features = compute_deltas(&states);
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].row_id, 1);
        assert_eq!(features[0].climb_rate, None);
        assert!(!features[0].unrealistic_climb);
        assert!(features[0].altitude_jump);
    }

    #[test]
    fn test_null_operands_never_flag() {
        let states = vec![
            state(0, "abc123", Some(0), None, None),
            state(1, "abc123", Some(5), Some(400.0), Some(9000.0)),
        ];
        let features = compute_deltas(&states);
        assert_eq!(features[0].velocity_delta, None);
        assert!(!features[0].sudden_velocity);
        assert!(!features[0].altitude_jump);
        assert!(!features[0].unrealistic_climb);
    }

    #[test]
    fn test_partitions_are_ordered_by_time_and_exclude_untimed() {
        let states = vec![
            state(0, "abc123", Some(30), Some(130.0), Some(1000.0)),
            state(1, "def456", Some(0), Some(50.0), Some(500.0)),
            state(2, "abc123", Some(0), Some(100.0), Some(1000.0)),
            state(3, "abc123", None, Some(999.0), Some(1000.0)),
            state(4, "def456", Some(10), Some(55.0), Some(510.0)),
        ];
        let features = compute_deltas(&states);

        let rows: Vec<RowId> = features.iter().map(|f| f.row_id).collect();
        assert_eq!(rows, vec![0, 4]);
        assert_eq!(features[0].prev_velocity, Some(100.0));
        assert_eq!(features[0].time_delta, 30.0);
        assert_eq!(features[1].velocity_delta, Some(5.0));
    }
}
