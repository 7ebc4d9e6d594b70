//! Configuration file loader for the `agentflow` binary.
//!
//! Reads an optional TOML file (`agentflow.toml` in the working directory
//! unless `--config` names another one). A missing default file yields the
//! defaults; a named file that is missing or malformed is an error.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use engine::EngineConfig;

pub const DEFAULT_CONFIG_FILE: &str = "agentflow.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    /// Size of the read pool; writes always use one connection.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://agentflow.db".to_owned(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: "info".to_owned(), json: false }
    }
}

impl AppConfig {
    /// Apply a database URL given on the command line or via `DATABASE_URL`.
    pub fn with_database_url(mut self, url: Option<String>) -> Self {
        if let Some(url) = url {
            self.database.url = url;
        }
        self
    }
}

/// Load the configuration from `path`, or from [`DEFAULT_CONFIG_FILE`] when
/// no path is given.
pub async fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let (config_path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound && !explicit => {
            return Ok(AppConfig::default());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", config_path.display()));
        }
    };

    toml::from_str::<AppConfig>(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))
}
