// src/utils/errors.rs
//! Error types shared by the agent and the controller

use std::time::Duration;
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, PlatformError>;

/// Errors produced by the executor, the plugin runtime and the sessions
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Script kind has no interpreter mapping; nothing was spawned
    #[error("unsupported script type: {0}")]
    UnsupportedKind(String),

    #[error("failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    /// Wall-clock limit hit; the process group was killed
    #[error("execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    /// Process ended on a signal instead of exiting
    #[error("process terminated by signal {0}")]
    Signaled(i32),

    /// Caller gave up while waiting for an executor slot
    #[error("execution cancelled before start")]
    Cancelled,

    #[error("plugin {0} already loaded")]
    PluginAlreadyLoaded(String),

    #[error("plugin {0} not loaded")]
    PluginNotLoaded(String),

    #[error("plugin {0} not running")]
    PluginNotRunning(String),

    #[error("plugin {0} already running")]
    PluginAlreadyRunning(String),

    /// Plugin wrote something that is not a JSON object line
    #[error("plugin {name} sent malformed data: {reason}")]
    PluginProtocol { name: String, reason: String },

    /// Plugin output pipe reached EOF
    #[error("plugin {0} closed its output channel")]
    PluginChannelClosed(String),

    #[error("agent {0} is not connected")]
    AgentNotConnected(String),

    /// Session went away before a correlated reply arrived
    #[error("session closed")]
    SessionClosed,

    #[error("could not reach controller at {0} in time")]
    ConnectTimeout(String),

    #[error("no reply from agent {agent_id} within {timeout:?}")]
    ReplyTimeout { agent_id: String, timeout: Duration },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for PlatformError {
    fn from(e: config::ConfigError) -> Self {
        PlatformError::Config(e.to_string())
    }
}

impl PlatformError {
    /// Whether the process never got to run to completion
    pub fn is_not_run(&self) -> bool {
        matches!(
            self,
            PlatformError::UnsupportedKind(_)
                | PlatformError::ProcessSpawnFailed(_)
                | PlatformError::Cancelled
        )
    }
}
