use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub server: ServerConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// Base URL of the tasks API (the collection lives at `<url>/tasks`)
  #[serde(default = "default_url")]
  pub url: Url,
  /// Per-request timeout in seconds
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      url: default_url(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

fn default_url() -> Url {
  Url::parse("http://localhost:3000").expect("static URL is valid")
}

fn default_timeout_secs() -> u64 {
  10
}

/// Who assigns the real identity of a newly added task.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IdAssignment {
  /// The server picks the id; the cache shows a negative placeholder until it answers
  #[default]
  Server,
  /// The cache picks an id above every id it has seen and sends it with the create
  Client,
}

/// What an update does with fields the caller left out.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpdateDefaults {
  /// Omitted `value`/`completed` become "Updated Task"/false
  #[default]
  Replace,
  /// Omitted fields keep their cached values and are not sent
  Preserve,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default)]
  pub id_assignment: IdAssignment,
  #[serde(default)]
  pub update_defaults: UpdateDefaults,
  /// Seconds a loaded list is served without refetching
  #[serde(default = "default_stale_secs")]
  pub stale_secs: u64,
  /// Seconds the list is kept after the last subscriber leaves
  #[serde(default = "default_keep_unused_secs")]
  pub keep_unused_secs: u64,
  /// Refetch in the background when a settled mutation invalidates the list
  #[serde(default = "default_true")]
  pub refetch_on_invalidate: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      id_assignment: IdAssignment::default(),
      update_defaults: UpdateDefaults::default(),
      stale_secs: default_stale_secs(),
      keep_unused_secs: default_keep_unused_secs(),
      refetch_on_invalidate: true,
    }
  }
}

impl CacheConfig {
  pub fn stale_time(&self) -> Duration {
    Duration::from_secs(self.stale_secs)
  }

  pub fn keep_unused_for(&self) -> Duration {
    Duration::from_secs(self.keep_unused_secs)
  }
}

fn default_stale_secs() -> u64 {
  60
}

fn default_keep_unused_secs() -> u64 {
  60
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Filter directive used when RUST_LOG is unset
  #[serde(default = "default_level")]
  pub level: String,
  /// Directory for TUI log files (default: $XDG_DATA_HOME/tasksync/logs)
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_level(),
      dir: None,
    }
  }
}

fn default_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tasksync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tasksync/config.yaml
  ///
  /// Without any file the defaults are used. `TASKSYNC_URL` overrides the server URL.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(url) = std::env::var("TASKSYNC_URL") {
      config.server.url =
        Url::parse(&url).map_err(|e| eyre!("Invalid TASKSYNC_URL '{}': {}", url, e))?;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tasksync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tasksync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Directory for log files when running the TUI.
  pub fn log_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.log.dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tasksync").join("logs"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_file_uses_defaults() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.server.url.as_str(), "http://localhost:3000/");
    assert_eq!(config.server.timeout_secs, 10);
    assert_eq!(config.cache.id_assignment, IdAssignment::Server);
    assert_eq!(config.cache.update_defaults, UpdateDefaults::Replace);
    assert_eq!(config.cache.stale_time(), Duration::from_secs(60));
    assert!(config.cache.refetch_on_invalidate);
    assert_eq!(config.log.level, "info");
  }

  #[test]
  fn test_full_file() {
    let yaml = r#"
server:
  url: http://tasks.internal:8080/api
  timeout_secs: 3
cache:
  id_assignment: client
  update_defaults: preserve
  stale_secs: 5
  keep_unused_secs: 0
  refetch_on_invalidate: false
log:
  level: debug
  dir: /tmp/tasksync
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.server.url.as_str(), "http://tasks.internal:8080/api");
    assert_eq!(config.server.timeout_secs, 3);
    assert_eq!(config.cache.id_assignment, IdAssignment::Client);
    assert_eq!(config.cache.update_defaults, UpdateDefaults::Preserve);
    assert_eq!(config.cache.keep_unused_for(), Duration::ZERO);
    assert!(!config.cache.refetch_on_invalidate);
    assert_eq!(config.log_dir().unwrap(), PathBuf::from("/tmp/tasksync"));
  }

  #[test]
  fn test_unknown_id_assignment_is_rejected() {
    assert!(Config::parse("cache:\n  id_assignment: random\n").is_err());
  }
}
