use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of one tumbling window: its start in epoch milliseconds
pub type WindowId = i64;

/// `[start, end)` bounds of a tumbling window
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WindowBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl WindowBounds {
    pub fn id(&self) -> WindowId {
        self.start.timestamp_millis()
    }

    /// Check if a timestamp falls within this window
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

/// Maps event timestamps onto fixed-duration, non-overlapping windows
///
/// Window boundaries are aligned to the Unix epoch, so every instance with the
/// same duration agrees on them: `start = floor(t / D) * D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowAssignor {
    duration_ms: i64,
}

impl WindowAssignor {
    /// Create an assignor for windows of the given length. Sub-millisecond
    /// durations are clamped to one millisecond.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration_ms: duration.num_milliseconds().max(1),
        }
    }

    /// Assignor for windows of `secs` seconds; fails when the length does
    /// not fit a `TimeDelta`
    pub fn from_secs(secs: u64) -> Result<Self> {
        let duration = i64::try_from(secs)
            .ok()
            .and_then(Duration::try_seconds)
            .context(format!("Window duration of {}s is out of range", secs))?;
        Ok(Self::new(duration))
    }

    pub fn duration(&self) -> Duration {
        Duration::milliseconds(self.duration_ms)
    }

    /// Window id for a timestamp
    pub fn window_id(&self, timestamp: DateTime<Utc>) -> WindowId {
        timestamp
            .timestamp_millis()
            .div_euclid(self.duration_ms)
            * self.duration_ms
    }

    /// Bounds of the window that contains `timestamp`
    ///
    /// `None` when the window would start or end outside the range chrono can
    /// represent (timestamps within one window length of either limit).
    pub fn assign(&self, timestamp: DateTime<Utc>) -> Option<WindowBounds> {
        self.bounds(self.window_id(timestamp))
    }

    /// Bounds for a window id produced by this assignor
    pub fn bounds(&self, id: WindowId) -> Option<WindowBounds> {
        let start = Utc.timestamp_millis_opt(id).single()?;
        let end = start.checked_add_signed(self.duration())?;
        Some(WindowBounds { start, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_window_alignment() {
        let assignor = WindowAssignor::from_secs(180).unwrap();

        let bounds = assignor.assign(ts(1_700_000_000)).unwrap();
        assert_eq!(bounds.start, ts(1_699_999_920));
        assert_eq!(bounds.end, ts(1_700_000_100));
        assert!(bounds.contains(ts(1_700_000_000)));
    }

    #[test]
    fn test_window_boundaries_are_half_open() {
        let assignor = WindowAssignor::from_secs(180).unwrap();

        let first = assignor.assign(ts(0)).unwrap();
        let last_of_first = assignor.assign(ts(179)).unwrap();
        let second = assignor.assign(ts(180)).unwrap();

        assert_eq!(first, last_of_first);
        assert_ne!(first, second);
        assert_eq!(first.end, second.start);
        assert!(!first.contains(ts(180)));
    }

    #[test]
    fn test_windows_tile_the_timeline() {
        let assignor = WindowAssignor::from_secs(180).unwrap();

        // Every second in a span lands in exactly one window and consecutive
        // windows share a boundary, so there are no gaps and no overlaps.
        let mut previous: Option<WindowBounds> = None;
        for secs in -1_000..1_000 {
            let t = ts(secs);
            let bounds = assignor.assign(t).unwrap();
            assert!(bounds.contains(t));
            assert_eq!(bounds.end - bounds.start, Duration::seconds(180));

            if let Some(prev) = previous
                && prev != bounds
            {
                assert_eq!(prev.end, bounds.start);
            }
            previous = Some(bounds);
        }
    }

    #[test]
    fn test_negative_timestamps_floor_downwards() {
        let assignor = WindowAssignor::from_secs(180).unwrap();
        let bounds = assignor.assign(ts(-1)).unwrap();
        assert_eq!(bounds.start, ts(-180));
        assert_eq!(bounds.end, ts(0));
    }

    #[test]
    fn test_bounds_round_trip_through_id() {
        let assignor = WindowAssignor::from_secs(60).unwrap();
        let bounds = assignor.assign(ts(1_234_567)).unwrap();
        assert_eq!(assignor.bounds(bounds.id()), Some(bounds));
    }

    #[test]
    fn test_windows_near_the_representable_limits_are_rejected() {
        let assignor = WindowAssignor::from_secs(180).unwrap();

        assert!(assignor.assign(DateTime::<Utc>::MAX_UTC).is_none());
        // Any window that is returned must contain its own timestamp
        let earliest = DateTime::<Utc>::MIN_UTC;
        assert!(
            assignor
                .assign(earliest)
                .is_none_or(|bounds| bounds.contains(earliest))
        );

        let far_future = Utc.timestamp_opt(8_210_266_876_799, 0).unwrap();
        assert!(assignor.assign(far_future).is_none());
    }

    #[test]
    fn test_out_of_range_duration_is_an_error() {
        assert!(WindowAssignor::from_secs(u64::MAX).is_err());
        assert!(WindowAssignor::from_secs(i64::MAX as u64).is_err());
        assert!(WindowAssignor::from_secs(180).is_ok());
    }
}
