use anyhow::{Context, Result, bail};
use metrics::{counter, gauge, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{error, info, warn};

use super::aggregator::ClosedWindow;
use crate::storage::WindowStore;

/// Closed windows waiting for the store. A window is a whole 3-minute batch,
/// so 64 slots is hours of backlog before ingress feels any backpressure.
pub const WINDOW_WRITE_QUEUE_SIZE: usize = 64;

const QUEUE_WARN_THRESHOLD: usize = WINDOW_WRITE_QUEUE_SIZE * 8 / 10;

/// Retry policy for a single window upload
#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Totals reported when the writer shuts down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub windows_stored: u64,
    pub windows_failed: u64,
    pub events_stored: u64,
}

/// Create the hand-off channel between the aggregator loop and the writer
pub fn window_channel() -> (mpsc::Sender<ClosedWindow>, mpsc::Receiver<ClosedWindow>) {
    mpsc::channel(WINDOW_WRITE_QUEUE_SIZE)
}

/// How a closed window reached the writer queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    Queued,
    /// The queue was full and ingress waited for the writer
    Waited,
}

/// Hand a closed window to the writer, waiting while the queue is full
///
/// A closed window is never dropped to keep ingress moving: a full queue
/// means the store is hours behind, and waiting here lets the source buffer
/// instead. Each wait is counted in `window_writer.backpressure_total`.
pub async fn send_window(
    tx: &mpsc::Sender<ClosedWindow>,
    window: ClosedWindow,
) -> Result<Handoff> {
    match tx.try_send(window) {
        Ok(()) => Ok(Handoff::Queued),
        Err(TrySendError::Full(window)) => {
            warn!(
                "Window write queue is full ({} windows), ingress is waiting for the store",
                WINDOW_WRITE_QUEUE_SIZE
            );
            counter!("window_writer.backpressure_total").increment(1);
            tx.send(window)
                .await
                .context("Window writer stopped accepting windows")?;
            Ok(Handoff::Waited)
        }
        Err(TrySendError::Closed(_)) => bail!("Window writer stopped accepting windows"),
    }
}

/// Writer task that persists closed windows off the ingress path
///
/// Runs until every sender is dropped and the queue is drained. Uploads are
/// idempotent (same key, full overwrite), so a failed attempt is simply retried.
pub async fn window_writer_task(
    mut rx: mpsc::Receiver<ClosedWindow>,
    store: Arc<dyn WindowStore>,
    config: WriterConfig,
) -> WriterStats {
    info!("Starting window writer for {}", store.describe());

    let mut stats = WriterStats::default();
    let mut warned = false;

    while let Some(window) = rx.recv().await {
        let queue_depth = rx.len();
        gauge!("window_writer.queue_depth").set(queue_depth as f64);

        if queue_depth >= QUEUE_WARN_THRESHOLD && !warned {
            warn!(
                "Window write queue is 80% full ({} / {} windows) - store may be falling behind",
                queue_depth, WINDOW_WRITE_QUEUE_SIZE
            );
            warned = true;
        } else if queue_depth < QUEUE_WARN_THRESHOLD {
            warned = false;
        }

        if persist_with_retry(store.as_ref(), &window, config).await {
            stats.windows_stored += 1;
            stats.events_stored += window.event_count() as u64;
        } else {
            stats.windows_failed += 1;
        }
    }

    info!(
        "Window writer shutting down: {} stored, {} failed",
        stats.windows_stored, stats.windows_failed
    );
    stats
}

async fn persist_with_retry(
    store: &dyn WindowStore,
    window: &ClosedWindow,
    config: WriterConfig,
) -> bool {
    let attempts = config.max_attempts.max(1);

    for attempt in 1..=attempts {
        let start = Instant::now();
        match store.put_window(window).await {
            Ok(_) => {
                counter!("window_writer.windows_stored_total").increment(1);
                histogram!("window_writer.duration_ms").record(start.elapsed().as_millis() as f64);
                return true;
            }
            Err(e) if attempt < attempts => {
                warn!(
                    "Failed to store window ending {} (attempt {}/{}): {:#}",
                    window.window_end(),
                    attempt,
                    attempts,
                    e
                );
                counter!("window_writer.retries_total").increment(1);
                tokio::time::sleep(config.retry_delay * attempt).await;
            }
            Err(e) => {
                error!(
                    "Giving up on window ending {} with {} events: {:#}",
                    window.window_end(),
                    window.event_count(),
                    e
                );
                counter!("window_writer.errors_total").increment(1);
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AircraftEvent;
    use crate::window::WindowAssignor;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Store that fails a configurable number of times before succeeding
    struct FlakyStore {
        failures_left: AtomicU32,
        puts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WindowStore for FlakyStore {
        async fn put_window(&self, window: &ClosedWindow) -> Result<String> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("store unavailable");
            }
            let key = window.window_end().to_rfc3339();
            self.puts.lock().unwrap().push(key.clone());
            Ok(key)
        }

        async fn list_window_keys(&self) -> Result<Vec<String>> {
            Ok(self.puts.lock().unwrap().clone())
        }

        async fn get_window(&self, _key: &str) -> Result<Vec<AircraftEvent>> {
            Ok(Vec::new())
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    fn window(start_secs: i64) -> ClosedWindow {
        let bounds = WindowAssignor::from_secs(180)
            .unwrap()
            .assign(Utc.timestamp_opt(start_secs, 0).unwrap())
            .unwrap();
        let event = AircraftEvent::from_json(&format!(
            r#"{{"icao24":"abc123","time_position":{start_secs}}}"#
        ))
        .unwrap();
        ClosedWindow {
            bounds,
            events: vec![event],
        }
    }

    fn fast_retries(max_attempts: u32) -> WriterConfig {
        WriterConfig {
            max_attempts,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_writer_retries_then_stores() {
        let store = Arc::new(FlakyStore {
            failures_left: AtomicU32::new(2),
            puts: Mutex::new(Vec::new()),
        });
        let (tx, rx) = window_channel();
        let handle = tokio::spawn(window_writer_task(rx, store.clone(), fast_retries(3)));

        tx.send(window(0)).await.unwrap();
        drop(tx);

        let stats = handle.await.unwrap();
        assert_eq!(stats.windows_stored, 1);
        assert_eq!(stats.windows_failed, 0);
        assert_eq!(store.puts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_writer_gives_up_and_continues() {
        let store = Arc::new(FlakyStore {
            failures_left: AtomicU32::new(2),
            puts: Mutex::new(Vec::new()),
        });
        let (tx, rx) = window_channel();
        let handle = tokio::spawn(window_writer_task(rx, store.clone(), fast_retries(2)));

        tx.send(window(0)).await.unwrap();
        tx.send(window(180)).await.unwrap();
        drop(tx);

        let stats = handle.await.unwrap();
        assert_eq!(stats.windows_failed, 1);
        assert_eq!(stats.windows_stored, 1);
        assert_eq!(stats.events_stored, 1);
    }

    #[tokio::test]
    async fn test_full_queue_waits_instead_of_dropping() {
        let (tx, mut rx) = mpsc::channel(1);

        assert_eq!(send_window(&tx, window(0)).await.unwrap(), Handoff::Queued);

        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut ends = Vec::new();
            while let Some(window) = rx.recv().await {
                ends.push(window.window_end());
            }
            ends
        });

        assert_eq!(send_window(&tx, window(180)).await.unwrap(), Handoff::Waited);
        drop(tx);

        let ends = reader.await.unwrap();
        assert_eq!(ends, vec![window(0).window_end(), window(180).window_end()]);
    }

    #[tokio::test]
    async fn test_send_to_stopped_writer_is_an_error() {
        let (tx, rx) = window_channel();
        drop(rx);
        assert!(send_window(&tx, window(0)).await.is_err());
    }
}
