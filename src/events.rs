//! Aircraft telemetry samples as they arrive from the state-vector feed
//!
//! One `AircraftEvent` is a single state vector for one aircraft at one point
//! in time. Timestamps arrive in several shapes depending on the producer
//! (integer epoch seconds, fractional epoch seconds, or ISO-8601 strings), so
//! `time_position` is parsed leniently: anything unparseable becomes `None`
//! and the event is treated as unorderable downstream.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// One telemetry sample for one aircraft
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AircraftEvent {
    /// ICAO 24-bit address as lowercase hex (e.g., "4b1814")
    pub icao24: String,
    #[serde(default)]
    pub callsign: Option<String>,
    #[serde(default)]
    pub origin_country: Option<String>,
    /// Time of the last position report (may be missing or unparseable)
    #[serde(default, with = "lenient_timestamp")]
    pub time_position: Option<DateTime<Utc>>,
    #[serde(default, with = "lenient_timestamp")]
    pub last_contact: Option<DateTime<Utc>>,
    /// Ingestion time in epoch seconds, stamped by the producer
    #[serde(default)]
    pub snapshot_ts: Option<i64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub latitude: Option<f64>,
    /// Barometric altitude in meters
    #[serde(default)]
    pub baro_altitude: Option<f64>,
    /// Geometric altitude in meters
    #[serde(default)]
    pub geo_altitude: Option<f64>,
    #[serde(default)]
    pub on_ground: Option<bool>,
    /// Ground speed in m/s
    #[serde(default)]
    pub velocity: Option<f64>,
    #[serde(default)]
    pub true_track: Option<f64>,
    /// Vertical rate in m/s (positive is climbing)
    #[serde(default)]
    pub vertical_rate: Option<f64>,
    #[serde(default)]
    pub squawk: Option<String>,
    #[serde(default)]
    pub spi: Option<bool>,
    #[serde(default)]
    pub position_source: Option<i64>,
}

impl AircraftEvent {
    /// Parse one JSON mapping as produced by the ingest collaborator
    pub fn from_json(payload: &str) -> Result<Self> {
        let mut event: AircraftEvent =
            serde_json::from_str(payload).context("Failed to parse aircraft event JSON")?;
        event.icao24 = event.icao24.trim().to_lowercase();
        if event.icao24.is_empty() {
            anyhow::bail!("Aircraft event is missing icao24");
        }
        Ok(event)
    }

    /// Snapshot timestamp as a `DateTime`, if present and in range
    pub fn snapshot_time(&self) -> Option<DateTime<Utc>> {
        self.snapshot_ts
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }

    /// Time used for window assignment: position time, falling back to the snapshot clock
    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        self.time_position.or_else(|| self.snapshot_time())
    }
}

/// Lenient (de)serialization for optional timestamps
///
/// Accepts integer or fractional epoch seconds, RFC 3339 strings and naive
/// ISO-8601 strings (interpreted as UTC). Unparseable input yields `None`
/// rather than an error. Serializes as RFC 3339 so CSV and JSON round-trip.
pub(crate) mod lenient_timestamp {
    use super::*;
    use serde::de::{self, Deserializer, Visitor};
    use serde::ser::Serializer;
    use std::fmt;

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_option(OptionalTimestampVisitor)
    }

    struct OptionalTimestampVisitor;

    impl<'de> Visitor<'de> for OptionalTimestampVisitor {
        type Value = Option<DateTime<Utc>>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an epoch timestamp, an ISO-8601 string, or null")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_any(TimestampVisitor)
        }
    }

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = Option<DateTime<Utc>>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an epoch timestamp or an ISO-8601 string")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Utc.timestamp_opt(v, 0).single())
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(i64::try_from(v)
                .ok()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
            Ok(from_fractional_seconds(v))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(parse_timestamp_str(v))
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        // Booleans, maps and sequences are not timestamps; treat them as unparseable
        fn visit_bool<E: de::Error>(self, _v: bool) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: de::MapAccess<'de>,
        {
            while map
                .next_entry::<de::IgnoredAny, de::IgnoredAny>()?
                .is_some()
            {}
            Ok(None)
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            while seq.next_element::<de::IgnoredAny>()?.is_some() {}
            Ok(None)
        }
    }

    fn from_fractional_seconds(v: f64) -> Option<DateTime<Utc>> {
        if !v.is_finite() {
            return None;
        }
        let millis = (v * 1000.0).round();
        if millis.abs() > i64::MAX as f64 {
            return None;
        }
        Utc.timestamp_millis_opt(millis as i64).single()
    }

    /// Parse a timestamp string in any of the shapes the producers emit
    pub(crate) fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
            return Some(ts.with_timezone(&Utc));
        }

        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
                return Some(Utc.from_utc_datetime(&naive));
            }
        }

        // Numeric strings (CSV cells, stringly-typed JSON)
        trimmed.parse::<f64>().ok().and_then(from_fractional_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_integer_time_position() {
        let event = AircraftEvent::from_json(
            r#"{"icao24":"4B1814","time_position":1700000000,"velocity":230.5,"on_ground":false}"#,
        )
        .unwrap();

        assert_eq!(event.icao24, "4b1814");
        assert_eq!(event.time_position.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(event.velocity, Some(230.5));
        assert_eq!(event.on_ground, Some(false));
    }

    #[test]
    fn test_parse_iso_time_position() {
        let event = AircraftEvent::from_json(
            r#"{"icao24":"a1b2c3","time_position":"2024-03-01T12:00:05","snapshot_ts":1709294410}"#,
        )
        .unwrap();

        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).unwrap();
        assert_eq!(event.time_position, Some(expected));
    }

    #[test]
    fn test_unparseable_time_position_falls_back_to_snapshot() {
        let event = AircraftEvent::from_json(
            r#"{"icao24":"a1b2c3","time_position":"not a time","snapshot_ts":1709294410}"#,
        )
        .unwrap();

        assert!(event.time_position.is_none());
        assert_eq!(event.event_time().unwrap().timestamp(), 1_709_294_410);
    }

    #[test]
    fn test_null_and_missing_fields() {
        let event =
            AircraftEvent::from_json(r#"{"icao24":"a1b2c3","time_position":null}"#).unwrap();

        assert!(event.time_position.is_none());
        assert!(event.snapshot_ts.is_none());
        assert!(event.event_time().is_none());
        assert!(event.velocity.is_none());
    }

    #[test]
    fn test_missing_icao24_rejected() {
        assert!(AircraftEvent::from_json(r#"{"icao24":"  ","velocity":10.0}"#).is_err());
        assert!(AircraftEvent::from_json(r#"{"velocity":10.0}"#).is_err());
    }

    #[test]
    fn test_fractional_seconds() {
        let event =
            AircraftEvent::from_json(r#"{"icao24":"abc123","time_position":1700000000.25}"#)
                .unwrap();
        assert_eq!(
            event.time_position.unwrap().timestamp_millis(),
            1_700_000_000_250
        );
    }
}
