//! Configuration for the embedding daemon

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
}

/// Per-session knobs applied by the session handler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds between keepalive probes on a running session; 0 disables
    /// the keepalive loop.
    pub keepalive_interval_secs: u64,

    /// Environment preset for every child, applied before any per-channel
    /// `env` requests.
    pub default_env: HashMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 30,
            default_env: HashMap::new(),
        }
    }
}

impl SessionConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

impl Config {
    /// Load config from file, or return defaults if not found
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gantry")
            .join("config.toml")
    }
}
