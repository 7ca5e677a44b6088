// src/grpc/mod.rs
//! gRPC session layer between agents and the controller
//!
//! A single bidirectional `Session` RPC per agent carries two closed message
//! sets: `AgentMessage` upward and `ServerMessage` downward.
//!
//! - **client**: the agent side (register, heartbeat, dispatch commands)
//! - **server**: the controller side (accept sessions, record results)
//! - **registry**: connected agents and the controller's command API
//! - **store**: boundary to result persistence

pub mod client;
pub mod convert;
pub mod registry;
pub mod server;
pub mod store;

/// Generated protocol types
pub mod proto {
    tonic::include_proto!("fleet.v1");
}

pub use client::AgentClient;
pub use registry::{AgentRegistry, AgentSnapshot, PluginCommandOutcome};
pub use server::ControllerService;
pub use store::{InMemoryResultStore, ResultStore};

/// Outbound queue depth per session
pub(crate) const OUTBOUND_BUFFER: usize = 64;
