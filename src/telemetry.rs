//! Tracing initialization for the enclosing service.

use std::fs;
use std::path::PathBuf;

use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::{FileLoggingConfig, LogFormat, LoggingConfig};

const LOG_FILE_PREFIX: &str = "berth.log";

#[derive(Clone)]
pub struct TelemetryConfig {
    pub verbosity: u8,
    pub logging: LoggingConfig,
}

impl TelemetryConfig {
    pub fn new(verbosity: u8, logging: LoggingConfig) -> Self {
        Self { verbosity, logging }
    }
}

/// Keeps the non-blocking file appender alive; drop it last.
pub struct TelemetryGuard {
    _guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init(config: TelemetryConfig) -> TelemetryGuard {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(config.verbosity).into())
        .with_env_var("BERTH_LOG")
        .from_env_lossy();

    let mut guards = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.logging.stdout {
        layers.push(build_stdout_layer(config.logging.stdout_format));
    }

    let mut file_setup_error = None;
    if config.logging.file.enabled {
        let dir = resolve_log_dir(&config.logging.file);
        match fs::create_dir_all(&dir) {
            Ok(()) => {
                let (layer, guard) = build_file_layer(&config.logging.file, &dir);
                layers.push(layer);
                guards.push(guard);
            }
            Err(err) => {
                file_setup_error =
                    Some(format!("log dir init failed for {}: {err}", dir.display()));
            }
        }
    }

    layers.push(Box::new(filter));
    Registry::default().with(layers).init();

    if let Some(error) = file_setup_error {
        tracing::warn!("{error}");
    }

    TelemetryGuard { _guards: guards }
}

fn build_stdout_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true)
                .with_current_span(true),
        ),
    }
}

fn build_file_layer(
    config: &FileLoggingConfig,
    dir: &std::path::Path,
) -> (
    Box<dyn Layer<Registry> + Send + Sync>,
    tracing_appender::non_blocking::WorkerGuard,
) {
    let appender = tracing_appender::rolling::RollingFileAppender::new(
        tracing_appender::rolling::Rotation::DAILY,
        dir,
        LOG_FILE_PREFIX,
    );
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_names(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_thread_names(true)
                .with_current_span(true),
        ),
    };
    (layer, guard)
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::ERROR,
        1 => tracing::metadata::LevelFilter::INFO,
        _ => tracing::metadata::LevelFilter::DEBUG,
    }
}

fn resolve_log_dir(config: &FileLoggingConfig) -> PathBuf {
    config
        .dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("/var/log/berth"))
}
