//! Tracing subscriber setup for the CLI and worker processes.
//!
//! Console output (plain or JSON) plus an optional JSONL file layer so a
//! worker run can be inspected after the fact without a log aggregator.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Telemetry configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Whether to output JSON-structured logs to console.
    pub json_logs: bool,
    /// Log level filter (e.g., "gazette=info,warn").
    pub log_filter: String,
    /// Directory for JSONL log files. If None, console only.
    pub log_dir: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json_logs: false,
            log_filter: "gazette=info".into(),
            log_dir: None,
        }
    }
}

/// Initialize the global subscriber. `RUST_LOG` wins over the configured
/// filter. Call once per process.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    let console_layer = if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(FmtSpan::NONE)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_span_events(FmtSpan::NONE)
            .boxed()
    };

    // Option<Layer> is itself a Layer (no-op when None)
    let file_layer = if let Some(ref log_dir) = config.log_dir {
        std::fs::create_dir_all(log_dir)
            .context(format!("failed to create log dir: {}", log_dir.display()))?;

        let today = chrono::Utc::now().format("%Y-%m-%d");
        let log_file_path = log_dir.join(format!("gazette-{today}.jsonl"));

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file_path)
            .context(format!(
                "failed to open log file: {}",
                log_file_path.display()
            ))?;

        Some(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_ansi(false),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(())
}
