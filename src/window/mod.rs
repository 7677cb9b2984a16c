//! Tumbling-window aggregation with a grace period for late events

pub mod aggregator;
pub mod assignor;
pub mod clock;
pub mod writer;

pub use aggregator::{Admission, ClosedWindow, WindowAggregator, WindowState};
pub use assignor::{WindowAssignor, WindowBounds, WindowId};
pub use clock::{ClockMode, PipelineClock};
pub use writer::{
    Handoff, WriterConfig, WriterStats, send_window, window_channel, window_writer_task,
};
