//! Ingest loop: event source → window aggregator → window writer

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::event_sources::EventSource;
use crate::storage::WindowStore;
use crate::window::{
    Admission, ClockMode, ClosedWindow, PipelineClock, WindowAggregator, WriterConfig,
    WriterStats, send_window, window_channel, window_writer_task,
};

/// Why the ingest loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    Shutdown,
}

/// Totals for one consumer run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeReport {
    pub stop_reason: StopReason,
    pub events_read: u64,
    pub events_admitted: u64,
    pub late_dropped: u64,
    pub unassignable: u64,
    pub malformed: u64,
    /// In-flight windows discarded on shutdown
    pub windows_discarded: usize,
    pub writer: WriterStats,
}

/// Drives one event source through the aggregator until the stream ends or
/// the shutdown future resolves
pub struct Consumer {
    aggregator: Arc<WindowAggregator>,
    clock: Arc<PipelineClock>,
    tick: Duration,
    writer_config: WriterConfig,
}

impl Consumer {
    pub fn new(aggregator: Arc<WindowAggregator>, clock: Arc<PipelineClock>, tick: Duration) -> Self {
        Self {
            aggregator,
            clock,
            tick,
            writer_config: WriterConfig::default(),
        }
    }

    pub fn with_writer_config(mut self, writer_config: WriterConfig) -> Self {
        self.writer_config = writer_config;
        self
    }

    /// Run until the source is exhausted or `shutdown` completes
    ///
    /// At end of stream every in-flight window is flushed, since no more
    /// events can arrive. On shutdown only windows past their deadline are
    /// flushed; in-flight windows are discarded (a gap, never a partial batch
    /// overwriting a complete one after restart). A source error is handled
    /// like a shutdown and then returned, after the writer has stored every
    /// window already queued.
    pub async fn run<F>(
        &self,
        mut source: Box<dyn EventSource>,
        store: Arc<dyn WindowStore>,
        shutdown: F,
    ) -> Result<ConsumeReport>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let (tx, rx) = window_channel();
        let writer = tokio::spawn(window_writer_task(rx, store, self.writer_config));

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut events_read = 0u64;
        let outcome: Result<StopReason> = loop {
            tokio::select! {
                next = source.next_event() => {
                    let event = match next {
                        Ok(Some(event)) => event,
                        Ok(None) => break Ok(StopReason::EndOfStream),
                        Err(e) => break Err(e),
                    };
                    events_read += 1;
                    counter!("ingest.events_total").increment(1);

                    if let Some(event_time) = event.event_time() {
                        self.clock.observe(event_time);
                    }
                    let now = self.now();
                    if let Admission::LateDropped { window } = self.aggregator.admit(event, now) {
                        debug!("Dropped late event for window {}", window);
                    }

                    // Replays move the event clock much faster than the ticker
                    if self.clock.mode() == ClockMode::Event
                        && let Err(e) = self.emit(&tx, self.aggregator.advance(now)).await
                    {
                        break Err(e);
                    }
                }
                _ = ticker.tick() => {
                    if let Some(now) = self.clock.now()
                        && let Err(e) = self.emit(&tx, self.aggregator.advance(now)).await
                    {
                        break Err(e);
                    }
                }
                _ = &mut shutdown => {
                    info!("Received shutdown signal, stopping ingest");
                    break Ok(StopReason::Shutdown);
                }
            }
        };

        let mut windows_discarded = 0;
        let outcome = match outcome {
            Ok(StopReason::EndOfStream) => {
                info!("Event stream ended, flushing all in-flight windows");
                self.emit(&tx, self.aggregator.drain())
                    .await
                    .map(|_| StopReason::EndOfStream)
            }
            Ok(StopReason::Shutdown) => {
                windows_discarded = self.flush_expired(&tx).await;
                Ok(StopReason::Shutdown)
            }
            Err(e) => {
                error!("Ingest stopped on error: {:#}", e);
                windows_discarded = self.flush_expired(&tx).await;
                Err(e)
            }
        };

        drop(tx);
        info!("Waiting for window writer to drain its queue");
        let writer_stats = writer.await.context("Window writer task failed")?;
        let stop_reason = outcome.context(format!(
            "Ingest failed after {} events ({} windows stored)",
            events_read,
            writer_stats.windows_stored
        ))?;

        let report = ConsumeReport {
            stop_reason,
            events_read,
            events_admitted: self.aggregator.admitted_count(),
            late_dropped: self.aggregator.late_drop_count(),
            unassignable: self.aggregator.unassignable_count(),
            malformed: source.malformed_count(),
            windows_discarded,
            writer: writer_stats,
        };
        info!(
            "Consumer stopped: {} events read, {} admitted, {} late, {} unassignable, {} malformed, {} windows stored",
            report.events_read,
            report.events_admitted,
            report.late_dropped,
            report.unassignable,
            report.malformed,
            report.writer.windows_stored
        );
        Ok(report)
    }

    /// Emit windows past their deadline and return how many in-flight
    /// windows are left behind
    async fn flush_expired(&self, tx: &mpsc::Sender<ClosedWindow>) -> usize {
        if let Some(now) = self.clock.now()
            && let Err(e) = self.emit(tx, self.aggregator.advance(now)).await
        {
            error!("Failed to queue expired windows: {:#}", e);
        }
        let discarded = self.aggregator.in_flight();
        if discarded > 0 {
            warn!(
                "Discarding {} in-flight windows that have not reached their deadline",
                discarded
            );
        }
        discarded
    }

    /// Current time for admission; before the first timed event the event
    /// clock has no notion of now, and such events are unassignable anyway
    fn now(&self) -> DateTime<Utc> {
        self.clock.now().unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Queue closed windows for the writer, waiting while its queue is full
    async fn emit(
        &self,
        tx: &mpsc::Sender<ClosedWindow>,
        windows: Vec<ClosedWindow>,
    ) -> Result<()> {
        for window in windows {
            info!(
                "Window {} - {} closed with {} events",
                window.bounds.start,
                window.bounds.end,
                window.event_count()
            );
            send_window(tx, window).await?;
        }
        Ok(())
    }
}
