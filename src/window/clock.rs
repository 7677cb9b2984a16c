use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Which notion of "now" drives window closing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ClockMode {
    /// Processing time of the consumer host
    #[default]
    Wall,
    /// Highest event time observed so far (for replaying recorded feeds)
    Event,
}

/// Source of the current time for the aggregator
pub struct PipelineClock {
    mode: ClockMode,
    max_event_ms: AtomicI64,
}

impl PipelineClock {
    pub fn new(mode: ClockMode) -> Self {
        Self {
            mode,
            max_event_ms: AtomicI64::new(i64::MIN),
        }
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    /// Feed an observed event time; only moves the event clock forward
    pub fn observe(&self, event_time: DateTime<Utc>) {
        self.max_event_ms
            .fetch_max(event_time.timestamp_millis(), Ordering::Relaxed);
    }

    /// Current time. The event clock reads as `None` until the first event.
    pub fn now(&self) -> Option<DateTime<Utc>> {
        match self.mode {
            ClockMode::Wall => Some(Utc::now()),
            ClockMode::Event => {
                let ms = self.max_event_ms.load(Ordering::Relaxed);
                if ms == i64::MIN {
                    None
                } else {
                    Utc.timestamp_millis_opt(ms).single()
                }
            }
        }
    }
}
