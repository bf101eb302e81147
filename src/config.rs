//! Configuration loader and validator for the library-sync daemon.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub catalog: Catalog,
    pub server: Server,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Number of queue workers to spawn.
    pub workers: u32,
    /// Fixed delay between page requests against the catalog API.
    pub page_delay_ms: u64,
    /// Settling delay before the completed-notification payload is re-read.
    pub settle_delay_ms: u64,
}

/// Remote catalog API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Catalog {
    pub api_base: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub page_size: u32,
}

/// Websocket/HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub bind: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.workers == 0 {
        return Err(ConfigError::Invalid("app.workers must be > 0"));
    }
    if cfg.app.page_delay_ms == 0 {
        return Err(ConfigError::Invalid("app.page_delay_ms must be > 0"));
    }

    if cfg.catalog.api_base.trim().is_empty() {
        return Err(ConfigError::Invalid("catalog.api_base must be non-empty"));
    }
    if cfg.catalog.token_url.trim().is_empty() {
        return Err(ConfigError::Invalid("catalog.token_url must be non-empty"));
    }
    if cfg.catalog.client_id.trim().is_empty() {
        return Err(ConfigError::Invalid("catalog.client_id must be non-empty"));
    }
    if cfg.catalog.client_secret.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "catalog.client_secret must be non-empty",
        ));
    }
    if cfg.catalog.page_size == 0 {
        return Err(ConfigError::Invalid("catalog.page_size must be > 0"));
    }

    if cfg.server.bind.trim().is_empty() {
        return Err(ConfigError::Invalid("server.bind must be non-empty"));
    }

    Ok(())
}

/// Example YAML shipped with the crate; also drives the config tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  workers: 4
  page_delay_ms: 1000
  settle_delay_ms: 200

catalog:
  api_base: "https://api.musiccatalog.example/v1/"
  token_url: "https://accounts.musiccatalog.example/api/token"
  client_id: "YOUR_CLIENT_ID"
  client_secret: "YOUR_CLIENT_SECRET"
  page_size: 50

server:
  bind: "127.0.0.1:8080"
"#
}
