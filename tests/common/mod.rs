//! Shared fixtures for integration tests
//!
//! Builds aircraft events, JSON-lines event files and the two reference CSV
//! files inside a temporary directory.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use airops::events::AircraftEvent;

/// Start of a 180 second window (aligned to the epoch)
pub const BASE_SECS: i64 = 1_699_999_920;

pub fn at(offset_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(BASE_SECS + offset_secs, 0).unwrap()
}

/// One airborne state vector at `BASE_SECS + offset_secs`
pub fn event(icao24: &str, offset_secs: i64, velocity: f64, baro_altitude: f64) -> AircraftEvent {
    AircraftEvent {
        icao24: icao24.to_string(),
        callsign: None,
        origin_country: Some("Ireland".to_string()),
        time_position: Some(at(offset_secs)),
        last_contact: Some(at(offset_secs)),
        snapshot_ts: Some(BASE_SECS + offset_secs),
        longitude: Some(-6.27),
        latitude: Some(53.42),
        baro_altitude: Some(baro_altitude),
        geo_altitude: None,
        on_ground: Some(false),
        velocity: Some(velocity),
        true_track: Some(270.0),
        vertical_rate: None,
        squawk: None,
        spi: Some(false),
        position_source: Some(0),
    }
}

/// JSON line for an event with an integer epoch `time_position`
pub fn event_line(icao24: &str, offset_secs: i64, velocity: f64) -> String {
    format!(
        r#"{{"icao24":"{}","time_position":{},"velocity":{},"baro_altitude":10000.0,"on_ground":false}}"#,
        icao24,
        BASE_SECS + offset_secs,
        velocity
    )
}

/// Write `lines` as a JSON-lines file and return its path
pub fn write_event_file(dir: &Path, lines: &[String]) -> PathBuf {
    let path = dir.join("events.jsonl");
    let mut file = fs::File::create(&path).unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
    path
}

/// Reference files mapping every `icao24` in `typed` to a type designator
pub fn write_reference_files(dir: &Path, typed: &[(&str, &str)]) -> (PathBuf, PathBuf) {
    let airframes = dir.join("aircraftDatabase.csv");
    let mut file = fs::File::create(&airframes).unwrap();
    writeln!(
        file,
        "icao24,registration,manufacturername,model,typecode,icaoaircrafttype,operator,owner,categoryDescription"
    )
    .unwrap();
    for (index, (icao24, designator)) in typed.iter().enumerate() {
        writeln!(
            file,
            "{},EI-T{:02},Boeing,737-8AS,{},L2J,Ryanair,Ryanair,Large",
            icao24, index, designator
        )
        .unwrap();
    }

    let models = dir.join("doc8643AircraftTypes.csv");
    let mut file = fs::File::create(&models).unwrap();
    writeln!(
        file,
        "AircraftDescription,Description,Designator,EngineCount,EngineType,ManufacturerCode,ModelFullName,WTC"
    )
    .unwrap();
    writeln!(file, "LandPlane,L2J,B738,2,Jet,BOEING,737-800,M").unwrap();
    writeln!(file, "LandPlane,L2J,A320,2,Jet,AIRBUS,A-320,M").unwrap();

    (airframes, models)
}
