// src/runtime/mod.rs
//! Local execution on the agent
//!
//! - **Process Runner**: spawns `sh`/`python3`, collects output, enforces timeouts
//! - **Task Executor**: admission gate in front of the runner
//! - **Plugin / Plugin Manager**: long-lived helper processes speaking JSON lines
//!
//! # Architecture
//!
//! ```text
//!   TaskRequest ──▶ TaskExecutor ──(permit)──▶ ProcessRunner ──▶ sh -c / python3 -c
//!                        │
//!                  Semaphore(5)
//!
//!   InstallPlugin ──▶ PluginManager ──▶ Plugin ──stdin──▶  <data_dir>/plugins/<name>/<name>
//!                                          ◀──stdout──
//! ```

pub mod executor;
pub mod plugin;
pub mod plugin_manager;
pub mod process_runner;

pub use executor::{TaskExecutor, TaskOutcome, DEFAULT_MAX_CONCURRENT, EXIT_CODE_NOT_RUN};
pub use plugin::{Document, Plugin, PluginInfo};
pub use plugin_manager::PluginManager;
pub use process_runner::{ExecutionResult, ProcessRunner, ScriptKind};
