use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter (e.g. `finderid_sync=debug`).
pub const LOG_ENV: &str = "FINDERID_LOG";

/// Default log directory: $XDG_DATA_HOME/finderid/logs
pub fn default_log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|dir| dir.join("finderid").join("logs"))
}

/// Send tracing output to a daily rolling file so stdout stays clean for
/// command output. Keep the guard alive until exit to flush the log.
pub fn init(log_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "finderid-sync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
