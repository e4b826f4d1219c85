use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address.
    pub bind_addr: String,

    /// Port to listen on. Port 0 asks the OS for an ephemeral port.
    pub port: u16,

    /// Connections silent for longer than this are destroyed.
    pub idle_timeout_ms: u64,

    /// Log level.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 1234,
            idle_timeout_ms: 5000,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&contents).map_err(|e| ServerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_addr, self.port)
            .parse()
            .map_err(|_| ServerError::Config(format!("invalid bind address {}", self.bind_addr)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout_ms == 0 {
            return Err(ServerError::Config(
                "idle_timeout_ms must be > 0".to_string(),
            ));
        }
        self.listen_addr()?;
        Ok(())
    }
}
