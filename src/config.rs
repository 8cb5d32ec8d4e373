use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{ControllerSettings, RequestKey};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin that relative manifest paths resolve against
  #[serde(deserialize_with = "deserialize_url")]
  pub origin: Url,
  /// Version tag of the generation to install
  pub version: String,
  /// Name of the cache database (defaults to "precache")
  #[serde(default = "default_cache_name")]
  pub cache_name: String,
  /// Paths or URLs that must be cached before a version goes live
  pub manifest: Vec<String>,
  /// Interception scope, relative to the origin
  #[serde(default = "default_scope")]
  pub scope: String,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub log: LogConfig,
}

fn default_cache_name() -> String {
  "precache".to_string()
}

fn default_scope() -> String {
  "/".to_string()
}

fn deserialize_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let s = String::deserialize(deserializer)?;
  Url::parse(&s).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
  pub grace_period_ms: u64,
  pub max_retries: u32,
  pub retry_delay_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let settings = ControllerSettings::default();
    Self {
      grace_period_ms: settings.grace_period.as_millis() as u64,
      max_retries: settings.max_retries,
      retry_delay_ms: settings.retry_delay.as_millis() as u64,
    }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_ms: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_ms: 10_000 }
  }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter directive when PRECACHE_LOG is unset
  pub level: String,
  /// Write logs to `<dir>/precache.log` instead of stderr
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./precache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/precache/config.yaml
  ///
  /// `PRECACHE_VERSION` overrides the version tag.
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
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/precache/config.yaml"
        ))
      }
    };

    if let Ok(version) = std::env::var("PRECACHE_VERSION") {
      config.version = version;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("precache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("precache").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.version.trim().is_empty() {
      return Err(eyre!("Config 'version' must not be empty"));
    }
    if self.manifest.is_empty() {
      return Err(eyre!("Config 'manifest' must list at least one path"));
    }
    Ok(())
  }

  /// Manifest entries resolved against the origin as `GET` keys.
  pub fn manifest_keys(&self) -> Result<Vec<RequestKey>> {
    self
      .manifest
      .iter()
      .map(|entry| RequestKey::resolve(&self.origin, "GET", entry))
      .collect()
  }

  /// Interception scope as an absolute URL.
  pub fn scope_url(&self) -> Result<Url> {
    self
      .origin
      .join(&self.scope)
      .map_err(|e| eyre!("Invalid scope '{}': {}", self.scope, e))
  }

  pub fn controller_settings(&self) -> ControllerSettings {
    ControllerSettings {
      grace_period: Duration::from_millis(self.cache.grace_period_ms),
      max_retries: self.cache.max_retries,
      retry_delay: Duration::from_millis(self.cache.retry_delay_ms),
    }
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_millis(self.network.timeout_ms)
  }
}
