use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::window::{ClockMode, WindowAssignor};

/// Upper bound for the window length and the grace period
pub const MAX_WINDOW_SETTING_SECS: u64 = 30 * 24 * 60 * 60;

/// Where closed windows are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Fs,
    S3,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Fs => write!(f, "fs"),
            StorageBackend::S3 => write!(f, "s3"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowSettings {
    /// Tumbling window length
    pub duration_secs: u64,
    /// How long after a window ends late events are still admitted
    pub grace_secs: u64,
    pub clock: ClockMode,
    /// How often the consumer checks for windows past their deadline
    pub tick_millis: u64,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            duration_secs: 180,
            grace_secs: 540,
            clock: ClockMode::Wall,
            tick_millis: 1000,
        }
    }
}

impl WindowSettings {
    pub fn assignor(&self) -> Result<WindowAssignor> {
        WindowAssignor::from_secs(self.duration_secs)
    }

    pub fn grace(&self) -> Result<chrono::Duration> {
        i64::try_from(self.grace_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .context(format!("Grace period of {}s is out of range", self.grace_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub nats_url: String,
    pub subject: String,
    pub client_name: String,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            nats_url: "nats://localhost:4222".to_string(),
            subject: "aircraft.states".to_string(),
            client_name: "airops-consumer".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// Root directory for the filesystem backend
    pub root: PathBuf,
    /// Bucket for the S3 backend
    pub bucket: Option<String>,
    pub prefix: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            root: PathBuf::from("./data"),
            bucket: None,
            prefix: "processed".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceSettings {
    pub airframes_path: PathBuf,
    pub models_path: PathBuf,
}

impl Default for ReferenceSettings {
    fn default() -> Self {
        Self {
            airframes_path: PathBuf::from("./reference/aircraftDatabase.csv"),
            models_path: PathBuf::from("./reference/doc8643AircraftTypes.csv"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub output_dir: PathBuf,
    /// Number of most recent window batches loaded per pass
    pub history_windows: usize,
    /// Repeat the pass at this interval; run once when unset
    pub interval_secs: Option<u64>,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./tables"),
            history_windows: 2,
            interval_secs: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Serve Prometheus metrics on this port when set
    pub port: Option<u16>,
}

/// Top-level configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub window: WindowSettings,
    pub ingest: IngestSettings,
    pub storage: StorageSettings,
    pub reference: ReferenceSettings,
    pub analysis: AnalysisSettings,
    pub metrics: MetricsSettings,
}

impl PipelineConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: PipelineConfig =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Load config if the file exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {:?}", path);
            Self::load(path)
        } else {
            info!("No configuration at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.window.duration_secs == 0 {
            bail!("window.duration_secs must be positive");
        }
        if self.window.duration_secs > MAX_WINDOW_SETTING_SECS {
            bail!(
                "window.duration_secs must be at most {}",
                MAX_WINDOW_SETTING_SECS
            );
        }
        if self.window.grace_secs > MAX_WINDOW_SETTING_SECS {
            bail!("window.grace_secs must be at most {}", MAX_WINDOW_SETTING_SECS);
        }
        if self.window.tick_millis == 0 {
            bail!("window.tick_millis must be positive");
        }
        if self.analysis.interval_secs == Some(0) {
            bail!("analysis.interval_secs must be positive when set");
        }
        if self.analysis.history_windows == 0 {
            bail!("analysis.history_windows must be at least 1");
        }
        if self.storage.backend == StorageBackend::S3 && self.storage.bucket.is_none() {
            bail!("storage.bucket is required for the s3 backend");
        }
        Ok(())
    }
}

/// Resolve the config file path.
///
/// Priority:
/// 1. `AIROPS_CONFIG` env var
/// 2. `./airops.toml`
pub fn config_path() -> PathBuf {
    std::env::var("AIROPS_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./airops.toml"))
}
