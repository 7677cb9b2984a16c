//! Population baseline engine
//!
//! Builds a statistical profile per aircraft type designator and flags
//! observations that sit far outside their type's population. Types with
//! fewer than [`MIN_OBSERVATIONS`] usable observations get no profile, and
//! observations without a profile are not evaluated at all.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use super::enrich::{EnrichedState, RowId};
use super::stats::{ColumnSummary, mean};
use crate::events::lenient_timestamp;

pub const MIN_OBSERVATIONS: usize = 10;
pub const SIGMA_MULTIPLIER: f64 = 3.0;
pub const P95_MULTIPLIER: f64 = 1.2;
/// m/s
pub const UNUSUAL_VERTICAL_RATE: f64 = 50.0;
/// m/s; fast vertical movement below this ground speed is suspicious
pub const UNUSUAL_VERTICAL_RATE_MAX_VELOCITY: f64 = 100.0;

/// Statistics for one aircraft type designator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AircraftTypeProfile {
    pub type_designator: String,
    pub model_full_name: Option<String>,
    pub observation_count: usize,
    pub avg_velocity: f64,
    pub stddev_velocity: f64,
    pub p95_velocity: f64,
    pub avg_altitude: f64,
    pub stddev_altitude: f64,
    pub p95_altitude: f64,
    /// Mean of |vertical_rate| over observations that report one
    pub avg_vertical_rate: Option<f64>,
}

/// Per-observation baseline comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineFeatures {
    pub row_id: RowId,
    pub icao24: String,
    pub type_designator: String,
    #[serde(default, with = "lenient_timestamp")]
    pub time_position: Option<DateTime<Utc>>,
    pub velocity: Option<f64>,
    pub baro_altitude: Option<f64>,
    pub vertical_rate: Option<f64>,
    pub on_ground: Option<bool>,
    pub avg_velocity: f64,
    pub stddev_velocity: f64,
    pub p95_velocity: f64,
    pub avg_altitude: f64,
    pub stddev_altitude: f64,
    pub p95_altitude: f64,
    pub velocity_zscore: Option<f64>,
    pub altitude_zscore: Option<f64>,
    pub velocity_p95_ratio: Option<f64>,
    pub altitude_p95_ratio: Option<f64>,
    pub high_speed: bool,
    pub low_speed: bool,
    pub high_altitude: bool,
    pub low_altitude: bool,
    pub extreme_speed: bool,
    pub extreme_altitude: bool,
    pub unusual_vertical_rate: bool,
}

impl BaselineFeatures {
    fn evaluate(state: &EnrichedState, profile: &AircraftTypeProfile) -> Self {
        let velocity = state.velocity;
        let altitude = state.baro_altitude;
        let sigma_v = profile.stddev_velocity;
        let sigma_a = profile.stddev_altitude;

        let above = |value: Option<f64>, limit: f64| value.is_some_and(|v| v > limit);
        let below = |value: Option<f64>, limit: f64| value.is_some_and(|v| v < limit);

        Self {
            row_id: state.row_id,
            icao24: state.icao24.clone(),
            type_designator: profile.type_designator.clone(),
            time_position: state.time_position,
            velocity,
            baro_altitude: altitude,
            vertical_rate: state.vertical_rate,
            on_ground: state.on_ground,
            avg_velocity: profile.avg_velocity,
            stddev_velocity: sigma_v,
            p95_velocity: profile.p95_velocity,
            avg_altitude: profile.avg_altitude,
            stddev_altitude: sigma_a,
            p95_altitude: profile.p95_altitude,
            velocity_zscore: zscore(velocity, profile.avg_velocity, sigma_v),
            altitude_zscore: zscore(altitude, profile.avg_altitude, sigma_a),
            velocity_p95_ratio: ratio(velocity, profile.p95_velocity),
            altitude_p95_ratio: ratio(altitude, profile.p95_altitude),
            high_speed: sigma_v > 0.0
                && above(velocity, profile.avg_velocity + SIGMA_MULTIPLIER * sigma_v),
            low_speed: sigma_v > 0.0
                && below(velocity, profile.avg_velocity - SIGMA_MULTIPLIER * sigma_v),
            high_altitude: sigma_a > 0.0
                && above(altitude, profile.avg_altitude + SIGMA_MULTIPLIER * sigma_a),
            low_altitude: sigma_a > 0.0
                && state.on_ground == Some(false)
                && below(altitude, profile.avg_altitude - SIGMA_MULTIPLIER * sigma_a),
            extreme_speed: above(velocity, profile.p95_velocity * P95_MULTIPLIER),
            extreme_altitude: above(altitude, profile.p95_altitude * P95_MULTIPLIER),
            unusual_vertical_rate: state
                .vertical_rate
                .is_some_and(|rate| rate.abs() > UNUSUAL_VERTICAL_RATE)
                && below(velocity, UNUSUAL_VERTICAL_RATE_MAX_VELOCITY),
        }
    }

    pub fn any_flag(&self) -> bool {
        self.high_speed
            || self.low_speed
            || self.high_altitude
            || self.low_altitude
            || self.extreme_speed
            || self.extreme_altitude
            || self.unusual_vertical_rate
    }
}

fn zscore(value: Option<f64>, mean: f64, stddev: f64) -> Option<f64> {
    value.filter(|_| stddev > 0.0).map(|v| (v - mean) / stddev)
}

fn ratio(value: Option<f64>, p95: f64) -> Option<f64> {
    value.filter(|_| p95 != 0.0).map(|v| v / p95)
}

/// Build one profile per type designator with enough observations
///
/// Profiles are ordered by observation count (descending), then designator.
pub fn build_profiles(states: &[EnrichedState]) -> Vec<AircraftTypeProfile> {
    let mut groups: HashMap<&str, Vec<&EnrichedState>> = HashMap::new();
    for state in states {
        if let Some(designator) = state.type_designator()
            && state.velocity.is_some()
            && state.baro_altitude.is_some()
        {
            groups.entry(designator).or_default().push(state);
        }
    }

    let mut profiles: Vec<AircraftTypeProfile> = groups
        .into_par_iter()
        .filter(|(_, members)| members.len() >= MIN_OBSERVATIONS)
        .filter_map(|(designator, members)| build_profile(designator, &members))
        .collect();

    profiles.sort_by(|a, b| {
        b.observation_count
            .cmp(&a.observation_count)
            .then_with(|| a.type_designator.cmp(&b.type_designator))
    });
    profiles
}

fn build_profile(designator: &str, members: &[&EnrichedState]) -> Option<AircraftTypeProfile> {
    let velocity = ColumnSummary::from_values(members.iter().filter_map(|s| s.velocity).collect())?;
    let altitude =
        ColumnSummary::from_values(members.iter().filter_map(|s| s.baro_altitude).collect())?;
    let vertical_rates: Vec<f64> = members
        .iter()
        .filter_map(|s| s.vertical_rate.map(f64::abs))
        .collect();

    // Members arrive in corpus order, so the earliest model name wins
    let model_full_name = members.iter().find_map(|s| s.model_full_name.clone());

    Some(AircraftTypeProfile {
        type_designator: designator.to_string(),
        model_full_name,
        observation_count: members.len(),
        avg_velocity: velocity.mean,
        stddev_velocity: velocity.stddev,
        p95_velocity: velocity.p95,
        avg_altitude: altitude.mean,
        stddev_altitude: altitude.stddev,
        p95_altitude: altitude.p95,
        avg_vertical_rate: mean(&vertical_rates),
    })
}

/// Compare every observation that has a type profile against that profile
///
/// Output is sorted by row id.
pub fn evaluate_baselines(
    states: &[EnrichedState],
    profiles: &[AircraftTypeProfile],
) -> Vec<BaselineFeatures> {
    let by_designator: HashMap<&str, &AircraftTypeProfile> = profiles
        .iter()
        .map(|p| (p.type_designator.as_str(), p))
        .collect();

    let mut features: Vec<BaselineFeatures> = states
        .par_iter()
        .filter_map(|state| {
            let profile = by_designator.get(state.type_designator()?)?;
            Some(BaselineFeatures::evaluate(state, profile))
        })
        .collect();
    features.sort_by_key(|f| f.row_id);
    features
}

/// Output of one baseline run
#[derive(Debug, Clone, Default)]
pub struct BaselineOutput {
    pub profiles: Vec<AircraftTypeProfile>,
    pub features: Vec<BaselineFeatures>,
}

/// Build profiles and evaluate the corpus against them
pub fn run_baseline_engine(states: &[EnrichedState]) -> BaselineOutput {
    let profiles = build_profiles(states);
    let features = evaluate_baselines(states, &profiles);

    info!(
        "Built {} aircraft type profiles; evaluated {} of {} states ({} flagged)",
        profiles.len(),
        features.len(),
        states.len(),
        features.iter().filter(|f| f.any_flag()).count()
    );
    BaselineOutput { profiles, features }
}
