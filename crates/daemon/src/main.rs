//! `cairn-queue` binary
//!
//! Processors are application code, so this binary starts no workers unless
//! it is rebuilt with a populated registry (see `cairn_daemon::run`).

use anyhow::{Context, Result};
use cairn_daemon::{logging, DaemonConfig, ProcessorRegistry};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let config = DaemonConfig::from_env().context("invalid configuration")?;
    let _log_guard = logging::init(&config)?;

    info!(
        version = VERSION,
        backend = %config.backend,
        role = %config.role,
        "Cairn queue daemon starting"
    );

    cairn_daemon::run(config, ProcessorRegistry::new()).await
}
