//! Server configuration loaded from TOML
//!
//! All fields have defaults, so a missing file or an empty `quorum.toml`
//! both yield a working local setup.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use quorum_core::DEFAULT_EDIT_WINDOW_SECS;
use quorum_net::DEFAULT_PORT;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address to bind the listener to
    pub listen_addr: String,
    pub port: u16,
    /// How long a message stays editable, in seconds
    pub edit_window_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            edit_window_secs: DEFAULT_EDIT_WINDOW_SECS,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid listen address: {0}")]
    Addr(String),
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Load configuration, falling back to defaults when the file does
    /// not exist. A file that exists but fails to parse is an error, not
    /// a silent fallback.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.listen_addr, self.port)
            .parse()
            .map_err(|_| ConfigError::Addr(format!("{}:{}", self.listen_addr, self.port)))
    }
}
