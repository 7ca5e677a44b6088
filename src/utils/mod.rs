// src/utils/mod.rs
//! Configuration and error types shared across the crate

pub mod config;
pub mod errors;

pub use self::config::{AgentConfig, ControllerConfig, LogConfig, LogFormat};
pub use self::errors::{PlatformError, Result};
