use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::query::CacheOptions;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub backend: BackendConfig,
  /// Directory for log files (defaults to the data directory)
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Seconds a fetched value is served without refetching
  #[serde(default = "default_stale_time_secs")]
  pub stale_time_secs: u64,
  /// Seconds an unobserved entry is kept before collection
  #[serde(default = "default_gc_time_secs")]
  pub gc_time_secs: u64,
}

fn default_stale_time_secs() -> u64 {
  5 * 60
}

fn default_gc_time_secs() -> u64 {
  5 * 60
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: default_stale_time_secs(),
      gc_time_secs: default_gc_time_secs(),
    }
  }
}

impl CacheConfig {
  pub fn options(&self) -> CacheOptions {
    CacheOptions {
      stale_time: Duration::from_secs(self.stale_time_secs),
      gc_time: Duration::from_secs(self.gc_time_secs),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
  /// Local database; `path` defaults to the data directory
  Sqlite { path: Option<PathBuf> },
  /// Hosted backend; the API key comes from the environment
  Rest { url: String },
}

impl Default for BackendConfig {
  fn default() -> Self {
    BackendConfig::Sqlite { path: None }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./station-query.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/station-query/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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
      None => {
        debug!("no config file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("station-query.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("station-query").join("config.yaml");
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

  pub fn parse(contents: &str) -> Result<Self> {
    // An empty file is a valid, all-defaults config
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks STATION_QUERY_API_KEY.
  pub fn get_api_key() -> Result<String> {
    std::env::var("STATION_QUERY_API_KEY").map_err(|_| {
      eyre!("Backend API key not found. Set the STATION_QUERY_API_KEY environment variable.")
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::parse("").unwrap();
    assert_eq!(config.backend, BackendConfig::Sqlite { path: None });
    assert_eq!(config.cache.options(), CacheOptions::default());
  }

  #[test]
  fn test_rest_backend_and_cache_overrides() {
    let config = Config::parse(
      r#"
cache:
  stale_time_secs: 30
backend:
  kind: rest
  url: https://station.example.co
"#,
    )
    .unwrap();

    assert_eq!(
      config.backend,
      BackendConfig::Rest {
        url: "https://station.example.co".to_string()
      }
    );
    assert_eq!(config.cache.options().stale_time, Duration::from_secs(30));
    assert_eq!(config.cache.gc_time_secs, 300);
  }

  #[test]
  fn test_sqlite_path() {
    let config = Config::parse("backend:\n  kind: sqlite\n  path: /tmp/station.db\n").unwrap();
    assert_eq!(
      config.backend,
      BackendConfig::Sqlite {
        path: Some(PathBuf::from("/tmp/station.db"))
      }
    );
  }

  #[test]
  fn test_unknown_backend_is_rejected() {
    assert!(Config::parse("backend:\n  kind: firebase\n").is_err());
  }

  #[test]
  fn test_missing_explicit_file_is_an_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/station-query.yaml"))).is_err());
  }
}
