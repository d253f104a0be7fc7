use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Upstream origin every intercepted request is resolved against
  pub origin: Url,
  /// Address the proxy listens on
  #[serde(default = "default_listen")]
  pub listen: SocketAddr,
  /// Path prefix under the origin the worker controls
  #[serde(default = "default_scope")]
  pub scope: String,
  /// Directory holding the cache database (defaults to $XDG_DATA_HOME/swcache)
  pub data_dir: Option<PathBuf>,
  /// Write logs to this file instead of stderr
  pub log_file: Option<PathBuf>,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Background sync tag the queue is flushed under
  #[serde(default = "default_sync_tag")]
  pub tag: String,
  /// Form endpoint whose failed submissions are queued for retry
  #[serde(default = "default_form_path")]
  pub form_path: String,
  /// Sync runs per registration before giving up until the next one
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  /// Initial delay between sync retries, doubled on every attempt
  #[serde(default = "default_backoff_secs")]
  pub backoff_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: default_sync_tag(),
      form_path: default_form_path(),
      max_attempts: default_max_attempts(),
      backoff_secs: default_backoff_secs(),
    }
  }
}

fn default_listen() -> SocketAddr {
  SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_scope() -> String {
  "/".to_string()
}

fn default_timeout_secs() -> u64 {
  10
}

fn default_sync_tag() -> String {
  "contact-form".to_string()
}

fn default_form_path() -> String {
  "/rest/v1/contact_submissions".to_string()
}

fn default_max_attempts() -> u32 {
  3
}

fn default_backoff_secs() -> u64 {
  5
}

impl Config {
  /// Load configuration, letting `origin` override the file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swcache/config.yaml
  ///
  /// Without any file, an `origin` alone is enough to run with defaults.
  pub fn load(explicit_path: Option<&Path>, origin: Option<&str>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let origin = origin.map(parse_origin).transpose()?;

    match (path, origin) {
      (Some(p), origin) => {
        let config = Self::load_from_path(&p)?;
        Ok(match origin {
          Some(origin) => Config { origin, ..config },
          None => config,
        })
      }
      (None, Some(origin)) => Ok(Self::for_origin(origin)),
      (None, None) => Err(eyre!(
        "No configuration file found. Create one at ~/.config/swcache/config.yaml\n\
                 or pass --origin."
      )),
    }
  }

  /// Configuration with every default and the given origin.
  pub fn for_origin(origin: Url) -> Self {
    Self {
      origin,
      listen: default_listen(),
      scope: default_scope(),
      data_dir: None,
      log_file: None,
      network: NetworkConfig::default(),
      sync: SyncConfig::default(),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("swcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swcache").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;

    if !config.scope.starts_with('/') {
      return Err(eyre!("scope must start with '/': {}", config.scope));
    }
    if !config.sync.form_path.starts_with('/') {
      return Err(eyre!(
        "sync.form_path must start with '/': {}",
        config.sync.form_path
      ));
    }

    Ok(config)
  }

  /// Path of the SQLite database holding cache stores and the sync queue.
  pub fn database_path(&self) -> Result<PathBuf> {
    let dir = match &self.data_dir {
      Some(dir) => dir.clone(),
      None => dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
        .ok_or_else(|| eyre!("Could not determine data directory"))?
        .join("swcache"),
    };

    Ok(dir.join("cache.db"))
  }
}

fn parse_origin(origin: &str) -> Result<Url> {
  Url::parse(origin).map_err(|e| eyre!("Invalid origin {}: {}", origin, e))
}
