use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the admin API (e.g., "https://admin.example.com")
  pub url: Url,
  /// Per-request timeout in seconds
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// How long a fetched value is served without revalidation
  #[serde(default = "default_stale_time_secs")]
  pub stale_time_secs: i64,
  #[serde(default)]
  pub retry: RetryPolicy,
  /// Return unroutable invalidation events as errors instead of logging
  /// them. Defaults to on in debug builds.
  pub strict_routing: Option<bool>,
}

fn default_stale_time_secs() -> i64 {
  300
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: default_stale_time_secs(),
      retry: RetryPolicy::default(),
      strict_routing: None,
    }
  }
}

impl CacheConfig {
  pub fn stale_time(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.stale_time_secs)
  }

  pub fn strict_routing(&self) -> bool {
    self.strict_routing.unwrap_or(cfg!(debug_assertions))
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// Filter directives (e.g., "adminq=debug"); ADMINQ_LOG takes precedence
  pub filter: Option<String>,
  /// Append logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./adminq.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/adminq/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/adminq/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("adminq.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("adminq").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!(e))
  }

  /// Get the admin API token from the environment.
  ///
  /// Checks ADMINQ_API_TOKEN.
  pub fn get_api_token() -> Result<String> {
    std::env::var("ADMINQ_API_TOKEN").map_err(|_| {
      eyre!("Admin API token not found. Set the ADMINQ_API_TOKEN environment variable.")
    })
  }
}
