use locksmith_common::protocol::DEFAULT_MAX_FRAME_LENGTH;
use locksmith_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{LeaderError, Result};

/// Environment variable prefix for leader settings
pub const ENV_PREFIX: &str = "LOCKSMITH_LEADER";

/// Main configuration for the leader node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    /// Listener configuration
    pub network: NetworkConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface to bind
    pub host: String,
    /// Port to bind (0 picks an ephemeral port)
    pub port: u16,
    /// Largest accepted frame in bytes
    pub max_frame_length: usize,
    /// Close client connections idle for this long (0 disables)
    pub idle_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            idle_timeout_secs: 0,
        }
    }
}

impl LeaderConfig {
    /// Load configuration: defaults, then the optional file, then environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let toml_string =
            toml::to_string_pretty(self).map_err(|e| LeaderError::Config(e.to_string()))?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Apply command-line overrides for the listener address
    pub fn override_listen(&mut self, host: Option<String>, port: Option<u16>) {
        if let Some(host) = host {
            self.network.host = host;
        }
        if let Some(port) = port {
            self.network.port = port;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.network.host.trim().is_empty() {
            return Err("Listen host cannot be empty".to_string());
        }

        if self.network.max_frame_length == 0 {
            return Err("Maximum frame length cannot be 0".to_string());
        }

        Ok(())
    }

    /// `host:port` to bind
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.network.host, self.network.port)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.network.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
