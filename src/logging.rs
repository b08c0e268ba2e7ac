use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.to_ascii_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the console and JSON-lines file sinks. The returned guard must
/// outlive the last event or buffered file output is lost.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let console = config.console.then(|| {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_timer(ChronoLocal::new("%H:%M:%S".to_string()))
            .with_filter(filter(&config.level))
    });

    let mut guard = None;
    let file = if config.file.is_empty() {
        None
    } else {
        let path = Path::new(&config.file);
        let dir = path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        let name = path
            .file_name()
            .with_context(|| format!("log file path '{}' has no file name", config.file))?;

        let (writer, file_guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
        guard = Some(file_guard);
        Some(
            fmt::layer()
                .json()
                .with_current_span(false)
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter(&config.level)),
        )
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}
