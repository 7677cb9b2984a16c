//! Event source abstraction for aircraft state telemetry
//!
//! Every source yields [`AircraftEvent`]s decoded from JSON objects, one per
//! message or line:
//! - Production: a NATS subject fed by the state-vector poller
//! - Replay and testing: JSON lines from a file or stdin
//!
//! Malformed messages are logged, counted under `ingest.malformed_total` and
//! skipped, so a single bad payload never ends the stream.
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use metrics::counter;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tracing::{debug, info, warn};

use crate::events::AircraftEvent;

/// Trait for sources of aircraft events
#[async_trait]
pub trait EventSource: Send {
    /// Get the next event from the source
    ///
    /// Returns:
    /// - `Ok(Some(event))` - Next event available
    /// - `Ok(None)` - End of stream
    /// - `Err(e)` - Transport failure
    async fn next_event(&mut self) -> Result<Option<AircraftEvent>>;

    /// Number of messages skipped because they could not be decoded
    fn malformed_count(&self) -> u64;
}

fn record_malformed(origin: &str, error: &anyhow::Error) {
    warn!("Skipping malformed event from {}: {:#}", origin, error);
    counter!("ingest.malformed_total").increment(1);
}

/// NATS event source for live ingestion
pub struct NatsEventSource {
    subscriber: async_nats::Subscriber,
    subject: String,
    malformed: u64,
}

impl NatsEventSource {
    pub fn new(subscriber: async_nats::Subscriber, subject: impl Into<String>) -> Self {
        Self {
            subscriber,
            subject: subject.into(),
            malformed: 0,
        }
    }

    /// Connect to NATS and subscribe to `subject`
    ///
    /// # Arguments
    /// * `nats_url` - NATS server URL (e.g., "nats://localhost:4222")
    /// * `subject` - Subject carrying state vectors (e.g., "aircraft.states")
    /// * `client_name` - Client name for the NATS connection
    pub async fn connect(nats_url: &str, subject: &str, client_name: &str) -> Result<Self> {
        let client = async_nats::ConnectOptions::new()
            .name(client_name)
            .connect(nats_url)
            .await
            .context(format!("Failed to connect to NATS at {}", nats_url))?;

        let subscriber = client
            .subscribe(subject.to_string())
            .await
            .context(format!("Failed to subscribe to {}", subject))?;

        info!("Subscribed to NATS subject {} at {}", subject, nats_url);
        Ok(Self::new(subscriber, subject))
    }
}

#[async_trait]
impl EventSource for NatsEventSource {
    async fn next_event(&mut self) -> Result<Option<AircraftEvent>> {
        while let Some(msg) = self.subscriber.next().await {
            let decoded = std::str::from_utf8(&msg.payload)
                .context("Payload is not valid UTF-8")
                .and_then(AircraftEvent::from_json);

            match decoded {
                Ok(event) => return Ok(Some(event)),
                Err(e) => {
                    self.malformed += 1;
                    record_malformed(&self.subject, &e);
                }
            }
        }
        debug!("NATS subscription on {} ended", self.subject);
        Ok(None)
    }

    fn malformed_count(&self) -> u64 {
        self.malformed
    }
}

/// Newline-delimited JSON event source
///
/// Reads one JSON object per line from a file or stdin. Blank lines are
/// ignored. `next_event` is cancel safe, so it can sit in a `select!` next to
/// a timer without losing partially read lines.
pub struct JsonLinesSource {
    lines: Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>,
    origin: String,
    lines_read: usize,
    malformed: u64,
}

impl JsonLinesSource {
    pub fn new(reader: Box<dyn AsyncRead + Send + Unpin>, origin: impl Into<String>) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            origin: origin.into(),
            lines_read: 0,
            malformed: 0,
        }
    }

    /// Open a JSON-lines file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .await
            .context(format!("Failed to open event file {}", path.display()))?;

        debug!("Opened JSON-lines event source from: {:?}", path);
        Ok(Self::new(Box::new(file), path.display().to_string()))
    }

    /// Read events from standard input
    pub fn stdin() -> Self {
        Self::new(Box::new(tokio::io::stdin()), "stdin")
    }

    /// Number of lines consumed so far, including blank and malformed ones
    pub fn lines_read(&self) -> usize {
        self.lines_read
    }
}

#[async_trait]
impl EventSource for JsonLinesSource {
    async fn next_event(&mut self) -> Result<Option<AircraftEvent>> {
        loop {
            let Some(raw) = self
                .lines
                .next_line()
                .await
                .context(format!("Failed to read from {}", self.origin))?
            else {
                debug!(
                    "Reached end of {} after {} lines",
                    self.origin, self.lines_read
                );
                return Ok(None);
            };
            self.lines_read += 1;

            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            match AircraftEvent::from_json(line) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => {
                    self.malformed += 1;
                    let origin = format!("{} line {}", self.origin, self.lines_read);
                    record_malformed(&origin, &e);
                }
            }
        }
    }

    fn malformed_count(&self) -> u64 {
        self.malformed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_json_lines_source_reads_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"{{"icao24":"4CA7B3","time_position":1700000000,"velocity":120.5}}"#
        )
        .unwrap();
        writeln!(
            temp_file,
            r#"{{"icao24":"a0b1c2","snapshot_ts":1700000010}}"#
        )
        .unwrap();
        temp_file.flush().unwrap();

        let mut source = JsonLinesSource::from_file(temp_file.path()).await.unwrap();

        let first = source.next_event().await.unwrap().unwrap();
        assert_eq!(first.icao24, "4ca7b3");
        assert_eq!(first.velocity, Some(120.5));

        let second = source.next_event().await.unwrap().unwrap();
        assert_eq!(second.icao24, "a0b1c2");
        assert!(second.time_position.is_none());

        assert!(source.next_event().await.unwrap().is_none());
        assert_eq!(source.lines_read(), 2);
    }

    #[tokio::test]
    async fn test_json_lines_source_skips_malformed_and_blank_lines() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "not json at all").unwrap();
        writeln!(temp_file).unwrap();
        writeln!(temp_file, r#"{{"callsign":"NOICAO"}}"#).unwrap();
        writeln!(temp_file, r#"{{"icao24":"abc123","time_position":"garbage"}}"#).unwrap();
        temp_file.flush().unwrap();

        let mut source = JsonLinesSource::from_file(temp_file.path()).await.unwrap();

        let event = source.next_event().await.unwrap().unwrap();
        assert_eq!(event.icao24, "abc123");
        assert!(event.time_position.is_none());
        assert!(source.next_event().await.unwrap().is_none());

        assert_eq!(source.malformed_count(), 2);
        assert_eq!(source.lines_read(), 4);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let result = JsonLinesSource::from_file(temp_dir.path().join("absent.jsonl")).await;
        assert!(result.is_err());
    }
}
