//! Tracing subscriber setup

use crate::config::{DaemonConfig, LogFormat};
use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "cairn=info";
const LOG_FILE_PREFIX: &str = "cairn.log";

/// Initialize console logging, plus daily-rolling JSON files when
/// `CAIRN_LOG_DIR` is set.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// life of the process.
pub fn init(config: &DaemonConfig) -> Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?;

    let console = match config.log_format {
        // Production: JSON structured logging
        LogFormat::Json => fmt::layer().json().boxed(),
        // Development: Pretty formatting with colors
        LogFormat::Pretty => fmt::layer().pretty().boxed(),
    };

    let (file, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
        .try_init()?;
    Ok(guard)
}
