// src/grpc/convert.rs
//! Conversions between wire messages and runtime types

use crate::grpc::proto::{self, agent_message, server_message};
use crate::runtime::{Document, PluginInfo, ScriptKind, TaskOutcome};
use crate::utils::errors::{PlatformError, Result};
use std::collections::HashMap;

/// Interpreter for a wire task type; unknown and unspecified are rejected
pub fn script_kind(task_type: i32) -> Result<ScriptKind> {
    match proto::TaskType::try_from(task_type) {
        Ok(proto::TaskType::Shell) => Ok(ScriptKind::Shell),
        Ok(proto::TaskType::Python) => Ok(ScriptKind::Python),
        Ok(proto::TaskType::Unspecified) => {
            Err(PlatformError::UnsupportedKind("unspecified".to_string()))
        }
        Err(_) => Err(PlatformError::UnsupportedKind(format!("type {}", task_type))),
    }
}

impl From<ScriptKind> for proto::TaskType {
    fn from(kind: ScriptKind) -> Self {
        match kind {
            ScriptKind::Shell => proto::TaskType::Shell,
            ScriptKind::Python => proto::TaskType::Python,
        }
    }
}

/// Wire timeout to seconds; negative values mean no timeout
pub fn timeout_secs(timeout: i32) -> u64 {
    u64::try_from(timeout).unwrap_or(0)
}

impl From<TaskOutcome> for proto::TaskResult {
    fn from(outcome: TaskOutcome) -> Self {
        Self {
            task_id: outcome.task_id,
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        }
    }
}

impl From<proto::TaskResult> for TaskOutcome {
    fn from(result: proto::TaskResult) -> Self {
        Self {
            task_id: result.task_id,
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
        }
    }
}

impl From<PluginInfo> for proto::PluginInfo {
    fn from(info: PluginInfo) -> Self {
        Self {
            name: info.name,
            version: info.version,
            enabled: info.enabled,
        }
    }
}

impl From<proto::PluginInfo> for PluginInfo {
    fn from(info: proto::PluginInfo) -> Self {
        Self {
            name: info.name,
            version: info.version,
            enabled: info.enabled,
        }
    }
}

/// Plugin config as carried on the wire, lifted into a JSON document
pub fn config_document(config: HashMap<String, String>) -> Document {
    config
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect()
}

/// `Response` envelope body
pub fn response(result: &Result<()>) -> proto::Response {
    match result {
        Ok(()) => proto::Response {
            success: true,
            error: String::new(),
        },
        Err(e) => proto::Response {
            success: false,
            error: e.to_string(),
        },
    }
}

pub fn agent_message(message: agent_message::Message) -> proto::AgentMessage {
    proto::AgentMessage {
        message: Some(message),
    }
}

pub fn server_message(message: server_message::Message) -> proto::ServerMessage {
    proto::ServerMessage {
        message: Some(message),
    }
}

/// Short label of an agent message for logs
pub fn agent_message_kind(message: &agent_message::Message) -> &'static str {
    match message {
        agent_message::Message::Register(_) => "register",
        agent_message::Message::Heartbeat(_) => "heartbeat",
        agent_message::Message::TaskResult(_) => "task_result",
        agent_message::Message::TaskLog(_) => "task_log",
        agent_message::Message::InstallPluginResponse(_) => "install_plugin_response",
        agent_message::Message::UninstallPluginResponse(_) => "uninstall_plugin_response",
        agent_message::Message::ListPluginsResponse(_) => "list_plugins_response",
    }
}

/// Short label of a server message for logs
pub fn server_message_kind(message: &server_message::Message) -> &'static str {
    match message {
        server_message::Message::RegisterResponse(_) => "register_response",
        server_message::Message::HeartbeatAck(_) => "heartbeat_ack",
        server_message::Message::TaskRequest(_) => "task_request",
        server_message::Message::InstallPlugin(_) => "install_plugin",
        server_message::Message::UninstallPlugin(_) => "uninstall_plugin",
        server_message::Message::ListPlugins(_) => "list_plugins",
    }
}
