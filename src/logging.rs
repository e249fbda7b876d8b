//! Tracing setup: stderr output (plain or JSON) plus an optional
//! daily-rotated log file.

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{CONFIG_DIR, LoggingSection, default_log_level};

const LOG_FILE_PREFIX: &str = "dealflow.log";
const VERBOSE_LEVEL: &str = "dealflow=debug,tower_http=debug";

/// Where log files go when `[logging].dir` is unset.
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("dealflow").join("logs"))
        .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join("logs"))
}

/// Filter directive in effect: `--verbose` beats the configured level.
pub fn effective_level(config: &LoggingSection, verbose: bool) -> String {
    if verbose {
        VERBOSE_LEVEL.to_string()
    } else {
        config.level.clone()
    }
}

/// `RUST_LOG` if set, else `level`, else the built-in default.
fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new(default_log_level()))
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held
/// until the process exits.
pub fn init(config: &LoggingSection, verbose: bool) -> Result<Option<WorkerGuard>> {
    let level = effective_level(config, verbose);
    let mut layers: Vec<BoxedLayer> = Vec::new();

    let stderr_layer: BoxedLayer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_filter(build_filter(&level))
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(true)
            .with_filter(build_filter(&level))
            .boxed()
    };
    layers.push(stderr_layer);

    let mut guard = None;
    if config.file {
        let dir = config.dir.clone().unwrap_or_else(default_log_dir);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_filter(build_filter(&level))
                .boxed(),
        );
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
