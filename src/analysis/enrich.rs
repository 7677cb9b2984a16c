use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::info;

use crate::events::{AircraftEvent, lenient_timestamp};
use crate::reference::ReferenceData;

/// Position of a state in the loaded corpus; stable for one pass
pub type RowId = u64;

/// An aircraft state joined with its airframe and type reference rows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichedState {
    pub row_id: RowId,
    pub icao24: String,
    pub callsign: Option<String>,
    pub origin_country: Option<String>,
    #[serde(default, with = "lenient_timestamp")]
    pub time_position: Option<DateTime<Utc>>,
    #[serde(default, with = "lenient_timestamp")]
    pub last_contact: Option<DateTime<Utc>>,
    pub snapshot_ts: Option<i64>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub baro_altitude: Option<f64>,
    pub geo_altitude: Option<f64>,
    pub on_ground: Option<bool>,
    pub velocity: Option<f64>,
    pub true_track: Option<f64>,
    pub vertical_rate: Option<f64>,
    pub squawk: Option<String>,
    pub spi: Option<bool>,
    pub position_source: Option<i64>,

    // Airframe registry
    pub registration: Option<String>,
    pub manufacturername: Option<String>,
    pub model: Option<String>,
    pub typecode: Option<String>,
    pub icaoaircrafttype: Option<String>,
    pub operator: Option<String>,
    pub owner: Option<String>,
    pub category_description: Option<String>,

    // Type designator table
    pub model_full_name: Option<String>,
    pub aircraft_description: Option<String>,
    pub engine_count: Option<String>,
    pub engine_type: Option<String>,
    pub wtc: Option<String>,

    /// |vertical_rate| / velocity, only for airborne moving states
    pub climb_rate_ratio: Option<f64>,
    pub altitude_km: Option<f64>,
}

impl EnrichedState {
    /// Baseline grouping key: `typecode`, falling back to `icaoaircrafttype`
    pub fn type_designator(&self) -> Option<&str> {
        non_blank(self.typecode.as_deref()).or_else(|| non_blank(self.icaoaircrafttype.as_deref()))
    }

    fn from_event(row_id: RowId, event: &AircraftEvent, reference: &ReferenceData) -> Self {
        let airframe = reference.airframe(&event.icao24);
        let model = airframe.and_then(|a| reference.model_for(a));

        let climb_rate_ratio = match (event.velocity, event.baro_altitude) {
            (Some(velocity), Some(altitude)) if velocity > 0.0 && altitude > 0.0 => {
                event.vertical_rate.map(|rate| rate.abs() / velocity)
            }
            _ => None,
        };
        let altitude_km = event
            .baro_altitude
            .filter(|altitude| *altitude > 0.0)
            .map(|altitude| altitude / 1000.0);

        Self {
            row_id,
            icao24: event.icao24.clone(),
            callsign: event.callsign.clone(),
            origin_country: event.origin_country.clone(),
            time_position: event.time_position,
            last_contact: event.last_contact,
            snapshot_ts: event.snapshot_ts,
            longitude: event.longitude,
            latitude: event.latitude,
            baro_altitude: event.baro_altitude,
            geo_altitude: event.geo_altitude,
            on_ground: event.on_ground,
            velocity: event.velocity,
            true_track: event.true_track,
            vertical_rate: event.vertical_rate,
            squawk: event.squawk.clone(),
            spi: event.spi,
            position_source: event.position_source,

            registration: airframe.and_then(|a| a.registration.clone()),
            manufacturername: airframe.and_then(|a| a.manufacturername.clone()),
            model: airframe.and_then(|a| a.model.clone()),
            typecode: airframe.and_then(|a| a.typecode.clone()),
            icaoaircrafttype: airframe.and_then(|a| a.icaoaircrafttype.clone()),
            operator: airframe.and_then(|a| a.operator.clone()),
            owner: airframe.and_then(|a| a.owner.clone()),
            category_description: airframe.and_then(|a| a.category_description.clone()),

            model_full_name: model.and_then(|m| m.model_full_name.clone()),
            aircraft_description: model.and_then(|m| m.aircraft_description.clone()),
            engine_count: model.and_then(|m| m.engine_count.clone()),
            engine_type: model.and_then(|m| m.engine_type.clone()),
            wtc: model.and_then(|m| m.wtc.clone()),

            climb_rate_ratio,
            altitude_km,
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Coverage of the enrichment join
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinStats {
    pub total_rows: usize,
    pub unique_aircraft: usize,
    pub rows_with_airframe: usize,
    pub rows_with_model: usize,
}

impl JoinStats {
    fn percent(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            part as f64 / total as f64 * 100.0
        }
    }

    pub fn log(&self) {
        info!("Join statistics:");
        info!("  - Total rows: {}", self.total_rows);
        info!("  - Unique aircraft: {}", self.unique_aircraft);
        info!(
            "  - Rows with airframe data: {} ({:.1}%)",
            self.rows_with_airframe,
            Self::percent(self.rows_with_airframe, self.total_rows)
        );
        info!(
            "  - Rows with model data: {} ({:.1}%)",
            self.rows_with_model,
            Self::percent(self.rows_with_model, self.total_rows)
        );
    }
}

/// Left-join every state with reference data; output order matches input order
pub fn enrich_states(
    events: &[AircraftEvent],
    reference: &ReferenceData,
) -> (Vec<EnrichedState>, JoinStats) {
    let states: Vec<EnrichedState> = events
        .par_iter()
        .enumerate()
        .map(|(index, event)| EnrichedState::from_event(index as RowId, event, reference))
        .collect();

    let unique: HashSet<&str> = events.iter().map(|e| e.icao24.as_str()).collect();
    let mut stats = JoinStats {
        total_rows: states.len(),
        unique_aircraft: unique.len(),
        ..Default::default()
    };
    for airframe in events.iter().filter_map(|e| reference.airframe(&e.icao24)) {
        stats.rows_with_airframe += 1;
        if reference.model_for(airframe).is_some() {
            stats.rows_with_model += 1;
        }
    }

    (states, stats)
}
