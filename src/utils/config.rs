// src/utils/config.rs
//! Agent and controller configuration
//!
//! Both roles load an optional YAML file and then apply environment
//! overrides, e.g. `FLEET_AGENT__AGENT__ID=web-01` or
//! `FLEET_CONTROLLER__SERVER__LISTEN_ADDR=0.0.0.0:6000`.

use crate::utils::errors::{PlatformError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const AGENT_ENV_PREFIX: &str = "FLEET_AGENT";
const CONTROLLER_ENV_PREFIX: &str = "FLEET_CONTROLLER";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,

    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Where the agent connects to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Controller endpoint URI
    pub address: String,

    /// Use TLS with the platform's native roots
    pub tls: bool,

    /// Deadline for establishing the connection
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:50051".to_string(),
            tls: false,
            connect_timeout_secs: 10,
        }
    }
}

/// Agent identity and local runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Stable agent identifier, required
    pub id: String,

    /// Root of the plugin tree: `<data_dir>/plugins/<name>/<name>`
    pub data_dir: PathBuf,

    pub heartbeat_interval_secs: u64,

    /// Admission gate capacity of the task executor
    pub max_concurrent_tasks: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            id: String::new(),
            data_dir: PathBuf::from("/var/lib/agent"),
            heartbeat_interval_secs: 30,
            max_concurrent_tasks: 5,
        }
    }
}

/// Full agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: UpstreamConfig,
    pub agent: AgentSettings,
    pub log: LogConfig,
}

impl AgentConfig {
    /// Load from an optional file plus `FLEET_AGENT__*` environment overrides
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config: Self = load_layers(path, AGENT_ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.id.trim().is_empty() {
            return Err(PlatformError::Config("agent.id is required".into()));
        }
        if self.server.address.is_empty() {
            return Err(PlatformError::Config("server.address is required".into()));
        }
        if self.agent.max_concurrent_tasks == 0 {
            return Err(PlatformError::Config(
                "agent.max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if self.agent.heartbeat_interval_secs == 0 {
            return Err(PlatformError::Config(
                "agent.heartbeat_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.server.connect_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.agent.heartbeat_interval_secs)
    }
}

/// Controller listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub listen_addr: String,

    /// How long plugin commands wait for the agent's answer
    pub plugin_command_timeout_secs: u64,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:50051".to_string(),
            plugin_command_timeout_secs: 30,
        }
    }
}

/// Full controller configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub server: ListenConfig,
    pub log: LogConfig,
}

impl ControllerConfig {
    /// Load from an optional file plus `FLEET_CONTROLLER__*` environment overrides
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config: Self = load_layers(path, CONTROLLER_ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        if self.server.plugin_command_timeout_secs == 0 {
            return Err(PlatformError::Config(
                "server.plugin_command_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server.listen_addr.parse().map_err(|e| {
            PlatformError::Config(format!(
                "invalid server.listen_addr {:?}: {}",
                self.server.listen_addr, e
            ))
        })
    }

    pub fn plugin_command_timeout(&self) -> Duration {
        Duration::from_secs(self.server.plugin_command_timeout_secs)
    }
}

fn load_layers<T: for<'de> Deserialize<'de>>(path: Option<&str>, env_prefix: &str) -> Result<T> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(config::File::with_name(path).required(true));
    }

    let settings = builder
        .add_source(config::Environment::with_prefix(env_prefix).separator("__"))
        .build()?;

    Ok(settings.try_deserialize()?)
}
