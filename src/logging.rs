//! Tracing subscriber setup for the binary.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

const DEFAULT_FILTER: &str = "adminq=info";

/// Build the filter from ADMINQ_LOG, then the config file, then the default.
pub fn env_filter(config: &LogConfig) -> EnvFilter {
  if let Ok(filter) = EnvFilter::try_from_env("ADMINQ_LOG") {
    return filter;
  }
  config
    .filter
    .as_deref()
    .and_then(|directives| EnvFilter::try_new(directives).ok())
    .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Logs go to stderr, or to the configured
/// file through a non-blocking writer whose guard must outlive the program.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = env_filter(config);

  match &config.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

      let appender = tracing_appender::rolling::never(dir, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;
      Ok(None)
    }
  }
}
