//! Operator configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use tillsync_remote::ClientConfig;
use tillsync_sync::{EventLogConfig, SyncConfig};

/// Contents of the `--config` JSON file. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Shorthand for `client.base_url`.
    pub base_url: Option<String>,
    /// SQLite database path.
    pub database: Option<PathBuf>,
    pub client: ClientConfig,
    pub sync: SyncConfig,
    pub events: EventLogConfig,
}

impl AppConfig {
    /// Load from `path`, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Client settings with the top-level base URL applied.
    pub fn client_config(&self) -> ClientConfig {
        let mut client = self.client.clone();
        if let Some(base_url) = &self.base_url {
            client.base_url = base_url.clone();
        }
        client
    }

    /// Configured database path, else `<data dir>/tillsync/tillsync.db`.
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.database {
            return Ok(path.clone());
        }
        let dir = dirs::data_local_dir().context("No local data directory on this system")?;
        Ok(dir.join("tillsync").join("tillsync.db"))
    }
}
