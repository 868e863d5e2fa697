use color_eyre::{eyre::eyre, Result};
use tasksync::config::Config;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// RUST_LOG wins over the configured level
fn filter(config: &Config) -> EnvFilter {
  EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level))
}

/// Log to a daily rolling file; the TUI owns the terminal.
///
/// Keep the returned guard alive until exit so buffered lines get flushed.
pub fn init_file(config: &Config) -> Result<WorkerGuard> {
  let dir = config.log_dir()?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&dir, "tasksync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(filter(config))
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to install logger: {}", e))?;

  Ok(guard)
}

/// Log to stderr for one-shot commands.
pub fn init_stderr(config: &Config) -> Result<()> {
  tracing_subscriber::registry()
    .with(filter(config))
    .with(fmt::layer().with_writer(std::io::stderr))
    .try_init()
    .map_err(|e| eyre!("Failed to install logger: {}", e))
}
