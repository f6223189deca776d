use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::PaginationMode;
use crate::entity::ResourceType;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheSettings,
  /// Per-resource pagination overrides
  #[serde(default)]
  pub resources: BTreeMap<ResourceType, ResourceSettings>,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub url: String,
  /// Environment variable holding the bearer token
  #[serde(default = "default_token_env")]
  pub token_env: String,
}

fn default_token_env() -> String {
  "RESCACHE_API_TOKEN".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
  /// Seconds before a cached page is considered stale
  pub stale_time_secs: u64,
  /// Seconds before an in-flight request counts as a network failure
  pub request_timeout_secs: u64,
  /// Most rows fetched for a resource paginated on the client
  pub local_fallback_cap: u32,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      stale_time_secs: 300,
      request_timeout_secs: 30,
      local_fallback_cap: 1000,
    }
  }
}

impl CacheSettings {
  pub fn stale_time(&self) -> Duration {
    Duration::from_secs(self.stale_time_secs)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
  /// `server` when the endpoint paginates, `local` to page a bounded superset
  pub pagination: PaginationMode,
  pub page_size: u32,
}

impl Default for ResourceSettings {
  fn default() -> Self {
    Self {
      pagination: PaginationMode::Server,
      page_size: 20,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// tracing filter directive, e.g. "info" or "rescache=debug"
  pub level: String,
  /// Write daily-rotated log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "warn".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rescache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rescache/config.yaml
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
        "No configuration file found. Create one at ~/.config/rescache/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("rescache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rescache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  pub fn resource(&self, resource: ResourceType) -> ResourceSettings {
    self.resources.get(&resource).cloned().unwrap_or_default()
  }

  /// Read the API token from the configured environment variable.
  pub fn get_api_token(var: &str) -> Result<String> {
    std::env::var(var).map_err(|_| eyre!("API token not found. Set the {} environment variable.", var))
  }
}
