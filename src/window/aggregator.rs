//! Tumbling-window aggregator with a grace period for late events
//!
//! Each window moves through `Open → Closing → Emitted → Expired`:
//! - `Open` while `now < end`
//! - `Closing` while `end <= now < end + grace`; late events are still admitted
//! - `Emitted` once `now >= end + grace`; the next `advance` call flushes it
//! - `Expired` after the flush; the window is forgotten and its events are dropped
//!
//! Window state lives in a `DashMap` keyed by window id. Every mutation of a
//! window goes through the map's entry API, which holds the shard lock for that
//! key, so concurrent appends to the same window are serialized while appends to
//! other windows proceed in parallel.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

use super::assignor::{WindowAssignor, WindowBounds, WindowId};
use crate::events::AircraftEvent;

/// Lifecycle state of a single window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
    Open,
    Closing,
    Emitted,
    Expired,
}

impl WindowState {
    /// Whether events for this window are still appended
    pub fn accepts_events(&self) -> bool {
        matches!(self, WindowState::Open | WindowState::Closing)
    }
}

impl std::fmt::Display for WindowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowState::Open => write!(f, "open"),
            WindowState::Closing => write!(f, "closing"),
            WindowState::Emitted => write!(f, "emitted"),
            WindowState::Expired => write!(f, "expired"),
        }
    }
}

/// Outcome of offering one event to the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Event appended; `created` is true when this event materialized the window
    Appended { window: WindowId, created: bool },
    /// Window already expired or event older than the grace period
    LateDropped { window: WindowId },
    /// Event carries neither a position time nor a snapshot time, or its
    /// window (plus grace) falls outside the representable time range
    Unassignable,
}

/// In-memory state for one in-flight window
#[derive(Debug, Clone)]
struct WindowAccumulator {
    bounds: WindowBounds,
    grace_deadline: DateTime<Utc>,
    events: Vec<AircraftEvent>,
}

impl WindowAccumulator {
    /// `None` when the grace deadline is past the representable range
    fn new(bounds: WindowBounds, grace: Duration) -> Option<Self> {
        Some(Self {
            bounds,
            grace_deadline: bounds.end.checked_add_signed(grace)?,
            events: Vec::new(),
        })
    }

    fn state_at(&self, now: DateTime<Utc>) -> WindowState {
        if now < self.bounds.end {
            WindowState::Open
        } else if now < self.grace_deadline {
            WindowState::Closing
        } else {
            WindowState::Emitted
        }
    }
}

/// A window whose grace period has expired, ready to be persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedWindow {
    pub bounds: WindowBounds,
    pub events: Vec<AircraftEvent>,
}

impl ClosedWindow {
    /// Storage key timestamp for this window
    pub fn window_end(&self) -> DateTime<Utc> {
        self.bounds.end
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}

/// Keyed store of in-flight windows plus the admission policy
pub struct WindowAggregator {
    assignor: WindowAssignor,
    grace: Duration,
    windows: DashMap<WindowId, WindowAccumulator>,
    admitted: AtomicU64,
    late_dropped: AtomicU64,
    unassignable: AtomicU64,
    emitted: AtomicU64,
}

impl WindowAggregator {
    /// Negative grace periods are treated as zero
    pub fn new(assignor: WindowAssignor, grace: Duration) -> Self {
        Self {
            assignor,
            grace: grace.max(Duration::zero()),
            windows: DashMap::new(),
            admitted: AtomicU64::new(0),
            late_dropped: AtomicU64::new(0),
            unassignable: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
        }
    }

    /// Offer one event to its window
    ///
    /// 1. Window known and still `Open`/`Closing` → append.
    /// 2. Window known but past its deadline, or unknown with `now - t > grace` → drop.
    /// 3. Otherwise materialize the window and append.
    pub fn admit(&self, event: AircraftEvent, now: DateTime<Utc>) -> Admission {
        let Some(event_time) = event.event_time() else {
            trace!("Event for {} has no usable timestamp", event.icao24);
            return self.reject_unassignable();
        };
        let Some((bounds, accumulator)) = self
            .assignor
            .assign(event_time)
            .and_then(|bounds| Some((bounds, WindowAccumulator::new(bounds, self.grace)?)))
        else {
            debug!(
                "Event for {} at {} has no representable window",
                event.icao24, event_time
            );
            return self.reject_unassignable();
        };
        let window = bounds.id();
        let grace_deadline = accumulator.grace_deadline;

        let admission = match self.windows.entry(window) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().state_at(now).accepts_events() {
                    occupied.get_mut().events.push(event);
                    Admission::Appended {
                        window,
                        created: false,
                    }
                } else {
                    Admission::LateDropped { window }
                }
            }
            Entry::Vacant(vacant) => {
                if now - event_time > self.grace || !accumulator.state_at(now).accepts_events() {
                    Admission::LateDropped { window }
                } else {
                    vacant.insert(accumulator).events.push(event);
                    Admission::Appended {
                        window,
                        created: true,
                    }
                }
            }
        };

        match admission {
            Admission::Appended { created, .. } => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("windows.events_admitted_total").increment(1);
                if created {
                    debug!(
                        "Opened window {} .. {} (grace deadline {})",
                        bounds.start,
                        bounds.end,
                        grace_deadline
                    );
                    metrics::gauge!("windows.in_flight").set(self.windows.len() as f64);
                }
            }
            Admission::LateDropped { .. } => {
                self.late_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("windows.late_dropped_total").increment(1);
                trace!(
                    "Dropped late event at {} for window {} .. {}",
                    event_time, bounds.start, bounds.end
                );
            }
            Admission::Unassignable => {}
        }

        admission
    }

    fn reject_unassignable(&self) -> Admission {
        self.unassignable.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("windows.unassignable_total").increment(1);
        Admission::Unassignable
    }

    /// Flush every window whose grace deadline has passed
    ///
    /// Returned windows are removed from memory (they become `Expired`) and are
    /// ordered by window start. Each window is returned at most once.
    pub fn advance(&self, now: DateTime<Utc>) -> Vec<ClosedWindow> {
        // Collect first: removing while iterating would deadlock on the shard lock
        let due: Vec<WindowId> = self
            .windows
            .iter()
            .filter(|entry| entry.value().state_at(now) == WindowState::Emitted)
            .map(|entry| *entry.key())
            .collect();

        let mut closed: Vec<ClosedWindow> = due
            .into_iter()
            .filter_map(|id| {
                self.windows
                    .remove_if(&id, |_, acc| acc.state_at(now) == WindowState::Emitted)
            })
            .map(|(_, acc)| ClosedWindow {
                bounds: acc.bounds,
                events: acc.events,
            })
            .collect();
        closed.sort_by_key(|window| window.bounds.start);

        if !closed.is_empty() {
            self.record_emitted(&closed);
        }
        closed
    }

    /// Flush every in-flight window regardless of its deadline
    ///
    /// Used when the event source is exhausted and no further events can arrive.
    pub fn drain(&self) -> Vec<ClosedWindow> {
        let ids: Vec<WindowId> = self.windows.iter().map(|entry| *entry.key()).collect();
        let mut closed: Vec<ClosedWindow> = ids
            .into_iter()
            .filter_map(|id| self.windows.remove(&id))
            .map(|(_, acc)| ClosedWindow {
                bounds: acc.bounds,
                events: acc.events,
            })
            .collect();
        closed.sort_by_key(|window| window.bounds.start);

        if !closed.is_empty() {
            self.record_emitted(&closed);
        }
        closed
    }

    fn record_emitted(&self, closed: &[ClosedWindow]) {
        self.emitted
            .fetch_add(closed.len() as u64, Ordering::Relaxed);
        metrics::counter!("windows.emitted_total").increment(closed.len() as u64);
        metrics::gauge!("windows.in_flight").set(self.windows.len() as f64);
        for window in closed {
            metrics::histogram!("windows.events_per_window").record(window.event_count() as f64);
        }
    }

    /// State of a window as seen at `now`
    ///
    /// Unknown windows whose deadline has passed report `Expired`; unknown
    /// windows that could still be materialized report `None`.
    pub fn window_state(&self, window: WindowId, now: DateTime<Utc>) -> Option<WindowState> {
        if let Some(acc) = self.windows.get(&window) {
            return Some(acc.state_at(now));
        }
        let deadline = self
            .assignor
            .bounds(window)?
            .end
            .checked_add_signed(self.grace)?;
        (now >= deadline).then_some(WindowState::Expired)
    }

    /// Number of buffered events in a window
    pub fn buffered_events(&self, window: WindowId) -> usize {
        self.windows
            .get(&window)
            .map(|acc| acc.events.len())
            .unwrap_or(0)
    }

    pub fn in_flight(&self) -> usize {
        self.windows.len()
    }

    pub fn admitted_count(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    pub fn late_drop_count(&self) -> u64 {
        self.late_dropped.load(Ordering::Relaxed)
    }

    pub fn unassignable_count(&self) -> u64 {
        self.unassignable.load(Ordering::Relaxed)
    }

    pub fn emitted_count(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn event(icao24: &str, secs: i64) -> AircraftEvent {
        AircraftEvent::from_json(&format!(
            r#"{{"icao24":"{icao24}","time_position":{secs},"velocity":200.0}}"#
        ))
        .unwrap()
    }

    fn aggregator() -> WindowAggregator {
        WindowAggregator::new(WindowAssignor::from_secs(180).unwrap(), Duration::seconds(540))
    }

    #[test]
    fn test_open_window_appends() {
        let agg = aggregator();
        let result = agg.admit(event("abc123", 10), ts(20));

        assert_eq!(
            result,
            Admission::Appended {
                window: 0,
                created: true
            }
        );
        assert_eq!(agg.admit(event("abc123", 20), ts(25)), Admission::Appended {
            window: 0,
            created: false
        });
        assert_eq!(agg.buffered_events(0), 2);
        assert_eq!(agg.window_state(0, ts(25)), Some(WindowState::Open));
    }

    #[test]
    fn test_closing_window_still_admits() {
        let agg = aggregator();
        agg.admit(event("abc123", 10), ts(20));

        // Window [0, 180) has ended but grace runs until 720
        assert_eq!(agg.window_state(0, ts(300)), Some(WindowState::Closing));
        assert!(matches!(
            agg.admit(event("abc123", 170), ts(700)),
            Admission::Appended { created: false, .. }
        ));
        assert_eq!(agg.buffered_events(0), 2);
    }

    #[test]
    fn test_late_event_within_grace_materializes_window() {
        let agg = aggregator();

        // now - t = 540 <= grace: admitted even though the window ended long ago
        let result = agg.admit(event("abc123", 100), ts(640));
        assert_eq!(
            result,
            Admission::Appended {
                window: 0,
                created: true
            }
        );
        assert_eq!(agg.late_drop_count(), 0);
    }

    #[test]
    fn test_event_past_grace_is_dropped_and_counted() {
        let agg = aggregator();

        let result = agg.admit(event("abc123", 100), ts(641));
        assert_eq!(result, Admission::LateDropped { window: 0 });
        assert_eq!(agg.late_drop_count(), 1);
        assert_eq!(agg.in_flight(), 0);
    }

    #[test]
    fn test_advance_emits_exactly_once() {
        let agg = aggregator();
        agg.admit(event("abc123", 10), ts(20));
        agg.admit(event("def456", 200), ts(210));

        assert!(agg.advance(ts(719)).is_empty());

        let closed = agg.advance(ts(720));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].bounds.start, ts(0));
        assert_eq!(closed[0].window_end(), ts(180));
        assert_eq!(closed[0].event_count(), 1);

        assert!(agg.advance(ts(721)).is_empty());
        assert_eq!(agg.window_state(0, ts(721)), Some(WindowState::Expired));
        assert_eq!(agg.emitted_count(), 1);
        assert_eq!(agg.in_flight(), 1);
    }

    #[test]
    fn test_event_for_expired_window_is_dropped() {
        let agg = aggregator();
        agg.admit(event("abc123", 10), ts(20));
        agg.advance(ts(720));

        let result = agg.admit(event("abc123", 179), ts(720));
        assert_eq!(result, Admission::LateDropped { window: 0 });
        assert_eq!(agg.late_drop_count(), 1);
        assert_eq!(agg.in_flight(), 0);
    }

    #[test]
    fn test_multiple_windows_in_flight() {
        let agg = aggregator();
        for secs in [10, 200, 400, 600] {
            agg.admit(event("abc123", secs), ts(secs));
        }
        assert_eq!(agg.in_flight(), 4);

        // [0,180) expires at 720, [180,360) at 900
        let closed = agg.advance(ts(900));
        assert_eq!(closed.len(), 2);
        assert!(closed[0].bounds.start < closed[1].bounds.start);
        assert_eq!(agg.in_flight(), 2);
    }

    #[test]
    fn test_snapshot_fallback_and_unassignable() {
        let agg = aggregator();

        let fallback =
            AircraftEvent::from_json(r#"{"icao24":"abc123","snapshot_ts":50}"#).unwrap();
        assert!(matches!(
            agg.admit(fallback, ts(60)),
            Admission::Appended { window: 0, .. }
        ));

        let timeless = AircraftEvent::from_json(r#"{"icao24":"abc123"}"#).unwrap();
        assert_eq!(agg.admit(timeless, ts(60)), Admission::Unassignable);
        assert_eq!(agg.unassignable_count(), 1);
        assert_eq!(agg.late_drop_count(), 0);
    }

    #[test]
    fn test_drain_flushes_everything() {
        let agg = aggregator();
        agg.admit(event("abc123", 10), ts(20));
        agg.admit(event("abc123", 200), ts(210));

        let closed = agg.drain();
        assert_eq!(closed.len(), 2);
        assert_eq!(agg.in_flight(), 0);
    }

    #[test]
    fn test_concurrent_appends_are_not_lost() {
        let agg = Arc::new(aggregator());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        let secs = (worker * 250 + i) % 360;
                        agg.admit(event("abc123", secs), ts(360));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let closed = agg.drain();
        let total: usize = closed.iter().map(|w| w.event_count()).sum();
        assert_eq!(total, 2_000);
        assert_eq!(agg.admitted_count(), 2_000);
    }

    #[test]
    fn test_timestamp_at_the_range_limit_is_unassignable() {
        let agg = aggregator();
        let far_future = AircraftEvent::from_json(
            r#"{"icao24":"abc123","time_position":8210266876799,"velocity":200.0}"#,
        )
        .unwrap();
        assert!(far_future.time_position.is_some());

        assert_eq!(agg.admit(far_future, ts(60)), Admission::Unassignable);
        assert_eq!(agg.unassignable_count(), 1);
        assert_eq!(agg.in_flight(), 0);
        assert!(agg.advance(DateTime::<Utc>::MAX_UTC).is_empty());
    }

    #[test]
    fn test_grace_deadline_past_the_range_limit_is_unassignable() {
        // The window itself fits, but window end + grace does not
        let agg = WindowAggregator::new(
            WindowAssignor::from_secs(180).unwrap(),
            Duration::days(365),
        );
        let near_limit = DateTime::<Utc>::MAX_UTC - Duration::days(30);

        let mut event = event("abc123", 0);
        event.time_position = Some(near_limit);
        assert_eq!(agg.admit(event, near_limit), Admission::Unassignable);
        assert_eq!(agg.window_state(agg_window_id(near_limit), near_limit), None);
    }

    #[test]
    fn test_negative_grace_is_treated_as_zero() {
        let agg = WindowAggregator::new(
            WindowAssignor::from_secs(180).unwrap(),
            Duration::seconds(-1),
        );
        // On time: the window has not ended yet
        assert!(matches!(
            agg.admit(event("abc123", 10), ts(10)),
            Admission::Appended { .. }
        ));
        assert_eq!(agg.advance(ts(180)).len(), 1);
    }

    fn agg_window_id(t: DateTime<Utc>) -> WindowId {
        WindowAssignor::from_secs(180).unwrap().window_id(t)
    }
}
