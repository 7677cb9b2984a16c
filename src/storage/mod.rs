//! Object-store persistence for closed windows
//!
//! Every closed window is written as one batch keyed by its window end:
//!
//! ```text
//! <prefix>/date=YYYY/MM/DD/window_raw_<YYYYMMDDTHHMMSS>.csv.zst
//! ```
//!
//! Keys sort lexicographically in time order, so the loader finds the most
//! recent batch by taking the greatest key. Writing the same window twice
//! replaces the object under the same key instead of appending a second one.

pub mod codec;
pub mod fs;
pub mod s3;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::events::AircraftEvent;
use crate::window::ClosedWindow;

pub use fs::FsWindowStore;
pub use s3::S3WindowStore;

const KEY_FILE_PREFIX: &str = "window_raw_";
const KEY_FILE_SUFFIX: &str = ".csv.zst";
const KEY_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Persistence collaborator for window batches
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Write (or overwrite) the batch for a closed window, returning its key
    async fn put_window(&self, window: &ClosedWindow) -> Result<String>;

    /// All window keys under this store's prefix, in ascending key order
    async fn list_window_keys(&self) -> Result<Vec<String>>;

    /// Read back the events of one batch
    async fn get_window(&self, key: &str) -> Result<Vec<AircraftEvent>>;

    /// Human-readable location used in log lines
    fn describe(&self) -> String;

    /// The `count` most recent keys, oldest first
    async fn latest_window_keys(&self, count: usize) -> Result<Vec<String>> {
        let keys = self.list_window_keys().await?;
        let skip = keys.len().saturating_sub(count);
        Ok(keys.into_iter().skip(skip).collect())
    }
}

/// Build the storage key for a window ending at `window_end`
pub fn window_key(prefix: &str, window_end: DateTime<Utc>) -> String {
    let date_path = window_end.format("%Y/%m/%d");
    let stamp = window_end.format(KEY_TIMESTAMP_FORMAT);
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("date={date_path}/{KEY_FILE_PREFIX}{stamp}{KEY_FILE_SUFFIX}")
    } else {
        format!("{prefix}/date={date_path}/{KEY_FILE_PREFIX}{stamp}{KEY_FILE_SUFFIX}")
    }
}

/// Recover the window end from a key, if the key names a window batch
pub fn parse_window_end(key: &str) -> Option<DateTime<Utc>> {
    let file_name = key.rsplit('/').next()?;
    let stamp = file_name
        .strip_prefix(KEY_FILE_PREFIX)?
        .strip_suffix(KEY_FILE_SUFFIX)?;
    let naive = NaiveDateTime::parse_from_str(stamp, KEY_TIMESTAMP_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Whether a key matches `<prefix>/date=*/*/*/window_raw_*.csv.zst`
pub fn is_window_key(prefix: &str, key: &str) -> bool {
    let prefix = prefix.trim_matches('/');
    let rest = if prefix.is_empty() {
        key
    } else {
        match key
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
        {
            Some(rest) => rest,
            None => return false,
        }
    };

    let parts: Vec<&str> = rest.split('/').collect();
    parts.len() == 4 && parts[0].starts_with("date=") && parse_window_end(parts[3]).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_key_layout() {
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 12, 3, 0).unwrap();
        assert_eq!(
            window_key("processed", end),
            "processed/date=2024/03/01/window_raw_20240301T120300.csv.zst"
        );
        assert_eq!(
            window_key("", end),
            "date=2024/03/01/window_raw_20240301T120300.csv.zst"
        );
    }

    #[test]
    fn test_parse_window_end_round_trip() {
        let end = Utc.with_ymd_and_hms(2024, 12, 31, 23, 57, 0).unwrap();
        let key = window_key("processed/", end);
        assert_eq!(parse_window_end(&key), Some(end));
        assert!(is_window_key("processed", &key));
    }

    #[test]
    fn test_is_window_key_rejects_foreign_objects() {
        assert!(!is_window_key(
            "processed",
            "processed/date=2024/03/01/aircraft_states_20240301T120300.parquet"
        ));
        assert!(!is_window_key(
            "processed",
            "other/date=2024/03/01/window_raw_20240301T120300.csv.zst"
        ));
        assert!(!is_window_key(
            "processed",
            "processed/window_raw_20240301T120300.csv.zst"
        ));
    }

    #[test]
    fn test_keys_sort_chronologically() {
        let earlier = Utc.with_ymd_and_hms(2024, 9, 30, 23, 59, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 10, 1, 0, 2, 0).unwrap();
        assert!(window_key("p", earlier) < window_key("p", later));
    }
}
