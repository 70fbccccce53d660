//! Logging and tracing configuration
//!
//! Provides structured logging for the CLI and an optional persistent run log.

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::paths;

/// File name of the persistent run log
const RUN_LOG_NAME: &str = "devicelab.log";

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("devicelab=info,warn"))
}

/// Initialize tracing for the CLI (stderr logging)
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate, WARN for dependencies.
pub fn init_cli() {
    tracing_subscriber::registry()
        .with(default_filter())
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

/// Initialize tracing for a test run (stderr + file logging)
///
/// The file receives full details through a non-blocking writer. The returned
/// guard must be kept alive for the duration of the run so buffered lines are
/// flushed.
pub fn init_run_log(dir: &Path) -> std::io::Result<(PathBuf, WorkerGuard)> {
    std::fs::create_dir_all(dir)?;

    let appender = tracing_appender::rolling::never(dir, RUN_LOG_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact();

    tracing_subscriber::registry()
        .with(default_filter())
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok((dir.join(RUN_LOG_NAME), guard))
}

/// Get the path to the default run log file
pub fn run_log_path() -> Option<PathBuf> {
    paths::log_dir().map(|d| d.join(RUN_LOG_NAME))
}
