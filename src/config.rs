use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Application origin; only same-origin requests are intercepted
  pub origin: Url,
  /// Worker version, used in static/dynamic tier names
  pub version: String,
  /// Prefix for every tier name
  pub cache_prefix: String,
  /// Version of the offline snapshot tier (independent of `version`)
  pub offline_version: String,
  /// Asset paths pre-warmed into the static tier at install
  pub manifest: Vec<String>,
  /// Path prefixes that identify API data requests
  pub api_prefixes: Vec<String>,
  /// Remote data provider hosts; URLs mentioning them are API data
  pub data_hosts: Vec<String>,
  /// Path fragments that identify image requests
  pub image_markers: Vec<String>,
  /// API path → offline snapshot path
  pub offline_fallbacks: BTreeMap<String, String>,
  pub network: NetworkConfig,
  pub storage: StorageConfig,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:5173").expect("valid default origin"),
      version: "v1".to_string(),
      cache_prefix: "skrm".to_string(),
      offline_version: "v1".to_string(),
      manifest: [
        "/",
        "/index.html",
        "/manifest.json",
        "/src/style.css",
        "/src/mobile.css",
        "/src/loading.css",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      api_prefixes: vec!["/api/".to_string(), "/rest/v1/".to_string()],
      data_hosts: vec!["supabase.co".to_string()],
      image_markers: vec![
        "/images/".to_string(),
        "/img/".to_string(),
        "/icons/".to_string(),
      ],
      offline_fallbacks: [
        ("/api/products", "/offline/products.json"),
        ("/api/customers", "/offline/customers.json"),
      ]
      .into_iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect(),
      network: NetworkConfig::default(),
      storage: StorageConfig::default(),
      log: LogConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Per-request timeout in seconds
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 10 }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Tier database path (defaults to $XDG_DATA_HOME/skrm-proxy/tiers.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Write daily-rotated log files here instead of stderr
  pub directory: Option<PathBuf>,
  /// Default filter directive; RUST_LOG takes precedence
  pub filter: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      directory: None,
      filter: "info".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./skrm-proxy.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/skrm-proxy/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found. The
  /// SKRM_PROXY_ORIGIN environment variable overrides the origin.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    config.with_env_overrides()?.validated()
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("skrm-proxy.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("skrm-proxy").join("config.yaml");
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
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  fn with_env_overrides(mut self) -> Result<Self> {
    if let Ok(origin) = std::env::var("SKRM_PROXY_ORIGIN") {
      self.origin = Url::parse(&origin)
        .map_err(|e| eyre!("Invalid SKRM_PROXY_ORIGIN '{}': {}", origin, e))?;
    }
    Ok(self)
  }

  fn validated(self) -> Result<Self> {
    if self.origin.cannot_be_a_base() {
      return Err(eyre!("Origin {} cannot be used as a base URL", self.origin));
    }
    if self.version.is_empty() || self.offline_version.is_empty() {
      return Err(eyre!("Tier versions must not be empty"));
    }
    if let Some(bad) = self.manifest.iter().find(|p| !p.starts_with('/')) {
      return Err(eyre!("Manifest entry '{}' must be an absolute path", bad));
    }
    Ok(self)
  }
}
