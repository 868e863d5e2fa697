mod app;
mod commands;
mod event;
mod logging;
mod ui;

use clap::Parser;
use color_eyre::Result;
use commands::Command;
use std::path::PathBuf;
use std::sync::Arc;
use tasksync::cache::TaskCache;
use tasksync::config::Config;
use tasksync::transport::HttpTransport;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "tasksync")]
#[command(about = "A terminal task list with optimistic sync to a REST backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tasksync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Base URL of the tasks API
  #[arg(short, long)]
  url: Option<Url>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Override server URL if specified on command line
  if let Some(url) = args.url {
    config.server.url = url;
  }

  let command = args.command.unwrap_or(Command::Tui);

  // The TUI owns the terminal, so it logs to a file
  let _guard = if command.is_interactive() {
    Some(logging::init_file(&config)?)
  } else {
    logging::init_stderr(&config)?;
    None
  };

  tracing::info!(url = %config.server.url, "starting tasksync");

  let transport = HttpTransport::new(&config.server)?;
  let cache = TaskCache::new(Arc::new(transport), &config.cache);

  match command {
    Command::Tui => app::App::new(cache).run().await?,
    command => commands::run(command, &cache).await?,
  }

  Ok(())
}
