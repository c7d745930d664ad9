//! Configuration for the record/replay proxy

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{PlayerError, Result};

/// Which mode the binary drives the Player into after `Start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Forward to `remote_address` and capture into `record_name`.
    Record,
    /// Replay `record_name` from the loaded cassette.
    Play,
}

/// Top-level configuration loaded from a TOML file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local address the Player listens on, e.g. `http://127.0.0.1:8080/`
    pub base_address: String,
    /// Upstream address requests are forwarded to while recording
    pub remote_address: String,
    /// Path to the cassette JSON file
    pub cassette_path: PathBuf,
    /// Whether to record or play on startup
    pub mode: Mode,
    /// Name of the Record to play or record into
    pub record_name: String,
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Resource limits applied to incoming and outbound bodies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum request/response body size in bytes
    pub max_body_size: usize,
    /// Maximum headers per request/response
    pub max_headers: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_size: 16 * 1024 * 1024, // 16 MB
            max_headers: 128,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PlayerError::ConfigError(format!("failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| PlayerError::ConfigError(format!("failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the base or remote address is empty, or if a limit is zero.
    pub fn validate(&self) -> Result<()> {
        if self.base_address.trim().is_empty() {
            return Err(PlayerError::ConfigError(
                "base_address cannot be empty".to_string(),
            ));
        }

        if self.remote_address.trim().is_empty() {
            return Err(PlayerError::ConfigError(
                "remote_address cannot be empty".to_string(),
            ));
        }

        if self.record_name.trim().is_empty() {
            return Err(PlayerError::ConfigError(
                "record_name cannot be empty".to_string(),
            ));
        }

        if self.limits.max_body_size == 0 {
            return Err(PlayerError::ConfigError(
                "max_body_size must be > 0".to_string(),
            ));
        }

        if self.limits.max_headers == 0 {
            return Err(PlayerError::ConfigError(
                "max_headers must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
