use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use airops::config::{PipelineConfig, StorageBackend, config_path};
use airops::log_format::PipelineLogFormat;
use airops::window::ClockMode;

mod commands;

use commands::{ConsumeSource, handle_analyze, handle_consume, handle_inspect};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(name = "airops")]
#[command(about = "Aircraft telemetry windowing and anomaly detection")]
#[command(version = env!("VERGEN_GIT_DESCRIBE"))]
struct Cli {
    /// Configuration file (defaults to $AIROPS_CONFIG or ./airops.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Group incoming aircraft states into tumbling windows and persist each closed window
    Consume {
        /// Read JSON lines from this file instead of NATS
        #[arg(long, conflicts_with = "stdin")]
        file: Option<PathBuf>,

        /// Read JSON lines from standard input instead of NATS
        #[arg(long)]
        stdin: bool,

        /// NATS server URL
        #[arg(long)]
        nats_url: Option<String>,

        /// NATS subject carrying aircraft states
        #[arg(long)]
        subject: Option<String>,

        /// Window length in seconds
        #[arg(long)]
        window_secs: Option<u64>,

        /// Grace period in seconds for late events
        #[arg(long)]
        grace_secs: Option<u64>,

        /// Clock that decides when windows close
        #[arg(long, value_enum)]
        clock: Option<ClockMode>,

        #[command(flatten)]
        storage: StorageArgs,

        /// Serve Prometheus metrics on this port
        #[arg(long)]
        metrics_port: Option<u16>,
    },

    /// Recompute the derived anomaly tables from the most recent windows
    Analyze {
        /// Number of most recent window batches to analyze
        #[arg(long)]
        history_windows: Option<usize>,

        /// Directory for the derived tables
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Airframe reference CSV
        #[arg(long)]
        airframes: Option<PathBuf>,

        /// Aircraft type reference CSV
        #[arg(long)]
        models: Option<PathBuf>,

        /// Repeat the pass every N seconds until Ctrl+C
        #[arg(long)]
        interval_secs: Option<u64>,

        #[command(flatten)]
        storage: StorageArgs,

        /// Serve Prometheus metrics on this port
        #[arg(long)]
        metrics_port: Option<u16>,
    },

    /// Show stored window batches and derived tables
    Inspect {
        #[command(flatten)]
        storage: StorageArgs,

        /// Directory of the derived tables
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct StorageArgs {
    /// Window store backend
    #[arg(long, value_enum)]
    storage: Option<StorageBackend>,

    /// Root directory for the fs backend
    #[arg(long)]
    storage_root: Option<PathBuf>,

    /// Bucket for the s3 backend
    #[arg(long)]
    bucket: Option<String>,

    /// Key prefix for window batches
    #[arg(long)]
    prefix: Option<String>,
}

impl StorageArgs {
    fn apply(self, config: &mut PipelineConfig) {
        if let Some(backend) = self.storage {
            config.storage.backend = backend;
        }
        if let Some(root) = self.storage_root {
            config.storage.root = root;
        }
        if let Some(bucket) = self.bucket {
            config.storage.bucket = Some(bucket);
        }
        if let Some(prefix) = self.prefix {
            config.storage.prefix = prefix;
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let ansi = std::io::IsTerminal::is_terminal(&std::io::stderr());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(ansi)
                .event_format(PipelineLogFormat::new(ansi)),
        )
        .init();
}

/// Install the recorder and serve it when a port is configured
///
/// Must run before the zero-initialization of metrics, which is a no-op
/// without a recorder.
fn spawn_metrics_server(port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        let handle = airops::metrics::init_metrics()?;
        tokio::spawn(async move {
            if let Err(e) = airops::metrics::start_metrics_server(handle, port).await {
                error!("Metrics server stopped: {:#}", e);
            }
        });
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(config_path);
    let mut config = PipelineConfig::load_or_default(&path)?;

    info!("airops {}", env!("VERGEN_GIT_DESCRIBE"));

    match cli.command {
        Commands::Consume {
            file,
            stdin,
            nats_url,
            subject,
            window_secs,
            grace_secs,
            clock,
            storage,
            metrics_port,
        } => {
            storage.apply(&mut config);
            if let Some(url) = nats_url {
                config.ingest.nats_url = url;
            }
            if let Some(subject) = subject {
                config.ingest.subject = subject;
            }
            if let Some(secs) = window_secs {
                config.window.duration_secs = secs;
            }
            if let Some(secs) = grace_secs {
                config.window.grace_secs = secs;
            }
            if let Some(clock) = clock {
                config.window.clock = clock;
            }
            if let Some(port) = metrics_port {
                config.metrics.port = Some(port);
            }
            config.validate()?;

            let source = match (file, stdin) {
                (Some(path), _) => ConsumeSource::File(path),
                (None, true) => ConsumeSource::Stdin,
                (None, false) => ConsumeSource::Nats,
            };

            spawn_metrics_server(config.metrics.port)?;
            airops::metrics::initialize_consumer_metrics();
            handle_consume(config, source).await
        }
        Commands::Analyze {
            history_windows,
            output_dir,
            airframes,
            models,
            interval_secs,
            storage,
            metrics_port,
        } => {
            storage.apply(&mut config);
            if let Some(count) = history_windows {
                config.analysis.history_windows = count;
            }
            if let Some(dir) = output_dir {
                config.analysis.output_dir = dir;
            }
            if let Some(path) = airframes {
                config.reference.airframes_path = path;
            }
            if let Some(path) = models {
                config.reference.models_path = path;
            }
            if let Some(secs) = interval_secs {
                config.analysis.interval_secs = Some(secs);
            }
            if let Some(port) = metrics_port {
                config.metrics.port = Some(port);
            }
            config.validate()?;

            spawn_metrics_server(config.metrics.port)?;
            airops::metrics::initialize_analysis_metrics();
            handle_analyze(config).await
        }
        Commands::Inspect {
            storage,
            output_dir,
        } => {
            storage.apply(&mut config);
            if let Some(dir) = output_dir {
                config.analysis.output_dir = dir;
            }
            config.validate()?;
            handle_inspect(config).await
        }
    }
}
