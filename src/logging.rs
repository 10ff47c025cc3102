//! Tracing setup.
//!
//! Verbosity is controlled with `RUST_LOG` (default `station_query=info`).
//! Logs go to a daily rolling file so stdout stays free for command output,
//! or to stderr when requested.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "station_query=info";

fn env_filter() -> EnvFilter {
  EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Default log directory under the user's data directory.
pub fn default_log_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("station-query").join("logs"))
}

/// Log to a daily file in `dir`. Keep the guard alive until exit so buffered
/// lines are flushed.
pub fn init_file(dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(dir, "station-query.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter())
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

/// Log to stderr.
pub fn init_stderr() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(env_filter())
    .with_writer(std::io::stderr)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))
}
