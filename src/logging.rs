//! Logging configuration and initialization for zipstage.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::{Result, ZipstageError};

/// HTTP client internals that log every connection at debug level.
const NOISY_TARGETS: [&str; 4] = ["hyper", "hyper_util", "reqwest", "rustls"];

fn parse_level(level: &str) -> Level {
    match level.trim().to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Build the filter: `RUST_LOG` first, then the configured level, with the
/// HTTP stack capped at `warn` unless `RUST_LOG` names it.
fn build_filter(level: &str) -> EnvFilter {
    let mut filter = EnvFilter::from_default_env().add_directive(parse_level(level).into());
    let from_env = std::env::var("RUST_LOG").unwrap_or_default();

    for target in NOISY_TARGETS {
        if from_env.contains(target) {
            continue;
        }
        if let Ok(directive) = format!("{target}=warn").parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Install the global subscriber.
///
/// Events go to stdout and are appended to `config.file`; an empty `file`
/// means console only. Fails if the log file cannot be opened or a
/// subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    if config.file.trim().is_empty() {
        return try_init_console(&config.level);
    }

    if let Some(parent) = Path::new(&config.file).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    // Sweeps run at every start; appending keeps their history.
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.file)?;
    let writer = std::io::stdout.and(Arc::new(log_file));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        )
        .with(build_filter(&config.level))
        .try_init()
        .map_err(|e| ZipstageError::Config(format!("logging already initialized: {e}")))
}

/// Console-only logging, used as a fallback and in development.
///
/// Does nothing if a subscriber is already installed.
pub fn init_console_only(level: &str) {
    let _ = try_init_console(level);
}

fn try_init_console(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(true),
        )
        .with(build_filter(level))
        .try_init()
        .map_err(|e| ZipstageError::Config(format!("logging already initialized: {e}")))
}
