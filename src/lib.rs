//! airops - aircraft telemetry windowing and anomaly detection
//!
//! The consumer side groups a stream of aircraft state vectors into
//! tumbling event-time windows with a grace period and persists each closed
//! window as one batch. The analysis side loads the most recent batches,
//! joins them with airframe and type reference data, and flags anomalies
//! from per-aircraft sequential deltas and per-type population baselines.

pub mod analysis;
pub mod config;
pub mod consumer;
pub mod event_sources;
pub mod events;
pub mod log_format;
pub mod metrics;
pub mod pipeline;
pub mod reference;
pub mod storage;
pub mod tables;
pub mod window;

pub use analysis::{AnomalyRecord, AnomalySummary, analyze_states, enrich_states};
pub use consumer::{ConsumeReport, Consumer, StopReason};
pub use events::AircraftEvent;
pub use window::{WindowAggregator, WindowAssignor};
