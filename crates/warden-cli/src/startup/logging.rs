//! Logging setup
//!
//! Console output goes to stderr so command output on stdout stays clean.
//! An optional rolling file (`warden.log`) can be enabled in configuration.
//! `RUST_LOG` takes precedence over the configured level for every layer.

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::model::LoggingSettings;

const LOG_FILE_NAME: &str = "warden.log";

/// Keeps the file writer alive; buffered output is flushed on drop.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber described by `settings`
pub fn init_logging(settings: &LoggingSettings) -> anyhow::Result<LoggingGuard> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut file_guard = None;

    if settings.console {
        let console_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(env_filter(&settings.level));
        layers.push(Box::new(console_layer));
    }

    if settings.file {
        std::fs::create_dir_all(&settings.dir)
            .with_context(|| format!("failed to create log directory {}", settings.dir.display()))?;

        let appender = RollingFileAppender::new(settings.rotation.into(), &settings.dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_names(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(env_filter(&settings.level));
        layers.push(Box::new(file_layer));
    }

    Registry::default()
        .with(layers)
        .try_init()
        .context("failed to initialize logging")?;

    if settings.file {
        tracing::debug!(log_dir = %settings.dir.display(), "File logging initialized");
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
