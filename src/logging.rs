use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

pub const DAEMON_LOG_PREFIX: &str = "daemon";
const MAX_LOG_FILES: usize = 7;

fn env_filter(verbose: bool) -> EnvFilter {
    let default_level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{}={default_level},warn",
            env!("CARGO_PKG_NAME").replace('-', "_")
        ))
    })
}

/// Logs to stderr only. Used by the short-lived CLI commands.
pub fn init_cli_logging(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Logs to stderr and to a daily rolling file under `log_dir`.
pub fn init_daemon_logging(log_dir: &Path, verbose: bool) -> Result<()> {
    let appender = Builder::new()
        .rotation(Rotation::DAILY)
        .max_log_files(MAX_LOG_FILES)
        .filename_prefix(DAEMON_LOG_PREFIX)
        .filename_suffix("log")
        .build(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_writer(std::io::stderr.and(appender))
        .with_ansi(false)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install logger: {err}"))
}
