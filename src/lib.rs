// src/lib.rs
//! Fleet Dispatch Library
//!
//! A controller pushes shell or Python tasks and plugin commands to a fleet
//! of agents over one long-lived bidirectional gRPC stream per agent.
//!
//! # Architecture
//!
//! - **runtime**: script execution behind an admission gate, plugin processes
//! - **grpc**: the agent session (client) and the controller session (server)
//! - **observability**: tracing setup and the injected metrics sink
//! - **utils**: configuration and the shared error type

pub mod grpc;
pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use grpc::{AgentClient, AgentRegistry, ControllerService, InMemoryResultStore, ResultStore};
pub use runtime::{PluginManager, ScriptKind, TaskExecutor, TaskOutcome};
pub use utils::config::{AgentConfig, ControllerConfig};
pub use utils::errors::{PlatformError, Result};

/// Reported to the controller at registration
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
