use locksmith_common::protocol::DEFAULT_MAX_FRAME_LENGTH;
use locksmith_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{FollowerError, Result};

/// Environment variable prefix for follower settings
pub const ENV_PREFIX: &str = "LOCKSMITH_FOLLOWER";

/// Main configuration for the follower node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowerConfig {
    /// Listener for local clients
    pub network: NetworkConfig,
    /// Where the leader lives
    pub leader: LeaderConfig,
    /// Control channel supervision
    pub control: ControlConfig,
    /// Client proxy behaviour
    pub proxy: ProxyConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
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
            port: 9001,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            idle_timeout_secs: 0,
        }
    }
}

/// Leader endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    /// `host:port` of the leader
    pub address: String,
    /// Dial timeout for the control channel and client upstreams
    pub connect_timeout_ms: u64,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9000".to_string(),
            connect_timeout_ms: 5000,
        }
    }
}

/// Control channel reconnection policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Redial the leader when the control channel drops
    pub reconnect: bool,
    /// Pause between reconnection attempts
    pub reconnect_interval_ms: u64,
    /// Give up after this many failed attempts (0 = never)
    pub max_reconnect_attempts: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            reconnect: true,
            reconnect_interval_ms: 1000,
            max_reconnect_attempts: 0,
        }
    }
}

/// Client proxy behaviour
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Answer `Check` from the replica cache instead of asking the leader.
    /// Such answers may lag the leader.
    pub serve_checks_from_cache: bool,
}

impl FollowerConfig {
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
            toml::to_string_pretty(self).map_err(|e| FollowerError::Config(e.to_string()))?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Apply command-line overrides
    pub fn override_with(&mut self, host: Option<String>, port: Option<u16>, leader: Option<String>) {
        if let Some(host) = host {
            self.network.host = host;
        }
        if let Some(port) = port {
            self.network.port = port;
        }
        if let Some(leader) = leader {
            self.leader.address = leader;
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

        self.leader_addr()?;

        if self.leader.connect_timeout_ms == 0 {
            return Err("Leader connect timeout cannot be 0".to_string());
        }

        Ok(())
    }

    /// `host:port` to bind
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.network.host, self.network.port)
    }

    pub fn leader_addr(&self) -> std::result::Result<SocketAddr, String> {
        self.leader
            .address
            .parse()
            .map_err(|e| format!("Invalid leader address '{}': {}", self.leader.address, e))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.leader.connect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.control.reconnect_interval_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.network.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
