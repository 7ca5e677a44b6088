// src/grpc/registry.rs
//! Connected agents and the controller's command API
//!
//! Each live session registers its agent here together with the sender half
//! of its outbound stream. Plugin commands carry a `request_id`; the reply
//! is routed back to the waiting caller through a oneshot channel.

use crate::grpc::convert::server_message;
use crate::grpc::proto::{self, server_message::Message};
use crate::runtime::PluginInfo;
use crate::utils::errors::{PlatformError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tonic::Status;
use tracing::{debug, info, warn};

/// Sender half of a session's outbound stream
pub type Outbound = mpsc::Sender<std::result::Result<proto::ServerMessage, Status>>;

/// Default wait for a plugin command reply
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Live state for one connected agent
pub struct ConnectedAgent {
    pub(crate) session_id: u64,
    pub agent_id: String,
    pub hostname: String,
    pub version: String,
    pub connected_at: DateTime<Utc>,
    last_heartbeat: parking_lot::Mutex<Option<DateTime<Utc>>>,
    outbound: Outbound,
}

impl ConnectedAgent {
    pub(crate) fn new(
        session_id: u64,
        register: proto::AgentRegister,
        outbound: Outbound,
    ) -> Self {
        Self {
            session_id,
            agent_id: register.agent_id,
            hostname: register.hostname,
            version: register.version,
            connected_at: Utc::now(),
            last_heartbeat: parking_lot::Mutex::new(None),
            outbound,
        }
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: self.agent_id.clone(),
            hostname: self.hostname.clone(),
            version: self.version.clone(),
            connected_at: self.connected_at,
            last_heartbeat: *self.last_heartbeat.lock(),
        }
    }
}

/// Point-in-time view of a connected agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub hostname: String,
    pub version: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Answer to an install or uninstall command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCommandOutcome {
    pub plugin_name: String,
    pub success: bool,
    pub error: Option<String>,
}

impl PluginCommandOutcome {
    fn new(plugin_name: String, success: bool, error: String) -> Self {
        Self {
            plugin_name,
            success,
            error: (!error.is_empty()).then_some(error),
        }
    }
}

/// Plugin reply routed back to a waiting command
#[derive(Debug)]
pub(crate) enum PluginReply {
    Install(proto::InstallPluginResponse),
    Uninstall(proto::UninstallPluginResponse),
    List(proto::ListPluginsResponse),
}

struct PendingReply {
    session_id: u64,
    reply: oneshot::Sender<PluginReply>,
}

/// Registry of connected agents
pub struct AgentRegistry {
    agents: DashMap<String, Arc<ConnectedAgent>>,
    pending: DashMap<String, PendingReply>,
    next_session: AtomicU64,
    reply_timeout: Duration,
}

impl AgentRegistry {
    pub fn new(reply_timeout: Duration) -> Self {
        Self {
            agents: DashMap::new(),
            pending: DashMap::new(),
            next_session: AtomicU64::new(1),
            reply_timeout,
        }
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    /// Record a registration, replacing any older session for the same agent
    pub(crate) fn register(&self, agent: ConnectedAgent) {
        let agent_id = agent.agent_id.clone();
        if let Some(previous) = self.agents.insert(agent_id.clone(), Arc::new(agent)) {
            info!(agent_id = %agent_id, "Agent re-registered, replacing session {}", previous.session_id);
        }
    }

    /// Drop the agent if it still belongs to `session_id`
    pub(crate) fn unregister(&self, agent_id: &str, session_id: u64) -> bool {
        self.pending.retain(|_, pending| pending.session_id != session_id);

        let removed = self
            .agents
            .remove_if(agent_id, |_, agent| agent.session_id == session_id)
            .is_some();
        if removed {
            info!(agent_id, "Agent disconnected");
        }
        removed
    }

    pub(crate) fn touch(&self, agent_id: &str, session_id: u64, at: DateTime<Utc>) {
        if let Some(agent) = self.agents.get(agent_id) {
            if agent.session_id == session_id {
                *agent.last_heartbeat.lock() = Some(at);
            }
        }
    }

    /// Hand a reply to whoever is waiting on `request_id`
    pub(crate) fn complete(&self, request_id: &str, reply: PluginReply) -> bool {
        match self.pending.remove(request_id) {
            Some((_, pending)) => pending.reply.send(reply).is_ok(),
            None => false,
        }
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentSnapshot> {
        self.agents.get(agent_id).map(|agent| agent.snapshot())
    }

    pub fn list_agents(&self) -> Vec<AgentSnapshot> {
        self.agents.iter().map(|entry| entry.value().snapshot()).collect()
    }

    /// Push a task to an agent; the result arrives later through the store
    pub async fn dispatch_task(&self, agent_id: &str, task: proto::TaskRequest) -> Result<()> {
        let task_id = task.task_id.clone();
        self.send(agent_id, Message::TaskRequest(task)).await?;
        info!(agent_id, task_id = %task_id, "Task dispatched");
        Ok(())
    }

    pub async fn install_plugin(
        &self,
        agent_id: &str,
        plugin_name: &str,
        config: HashMap<String, String>,
    ) -> Result<PluginCommandOutcome> {
        let plugin_name = plugin_name.to_string();
        let reply = self
            .request(agent_id, |request_id| {
                Message::InstallPlugin(proto::InstallPluginRequest {
                    request_id,
                    plugin_name,
                    config,
                })
            })
            .await?;

        match reply {
            PluginReply::Install(r) => Ok(PluginCommandOutcome::new(r.plugin_name, r.success, r.error)),
            other => Err(unexpected_reply("install", &other)),
        }
    }

    pub async fn uninstall_plugin(
        &self,
        agent_id: &str,
        plugin_name: &str,
    ) -> Result<PluginCommandOutcome> {
        let plugin_name = plugin_name.to_string();
        let reply = self
            .request(agent_id, |request_id| {
                Message::UninstallPlugin(proto::UninstallPluginRequest {
                    request_id,
                    plugin_name,
                })
            })
            .await?;

        match reply {
            PluginReply::Uninstall(r) => Ok(PluginCommandOutcome::new(r.plugin_name, r.success, r.error)),
            other => Err(unexpected_reply("uninstall", &other)),
        }
    }

    pub async fn list_plugins(&self, agent_id: &str) -> Result<Vec<PluginInfo>> {
        let reply = self
            .request(agent_id, |request_id| {
                Message::ListPlugins(proto::ListPluginsRequest { request_id })
            })
            .await?;

        match reply {
            PluginReply::List(r) => Ok(r.plugins.into_iter().map(PluginInfo::from).collect()),
            other => Err(unexpected_reply("list", &other)),
        }
    }

    fn agent(&self, agent_id: &str) -> Result<Arc<ConnectedAgent>> {
        self.agents
            .get(agent_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PlatformError::AgentNotConnected(agent_id.to_string()))
    }

    async fn send(&self, agent_id: &str, message: Message) -> Result<()> {
        let agent = self.agent(agent_id)?;
        agent
            .outbound
            .send(Ok(server_message(message)))
            .await
            .map_err(|_| PlatformError::AgentNotConnected(agent_id.to_string()))
    }

    async fn request<F>(&self, agent_id: &str, build: F) -> Result<PluginReply>
    where
        F: FnOnce(String) -> Message,
    {
        let agent = self.agent(agent_id)?;
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            request_id.clone(),
            PendingReply {
                session_id: agent.session_id,
                reply: tx,
            },
        );

        if agent
            .outbound
            .send(Ok(server_message(build(request_id.clone()))))
            .await
            .is_err()
        {
            self.pending.remove(&request_id);
            return Err(PlatformError::AgentNotConnected(agent_id.to_string()));
        }
        debug!(agent_id, request_id = %request_id, "Plugin command sent");

        match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(PlatformError::SessionClosed),
            Err(_) => {
                self.pending.remove(&request_id);
                warn!(agent_id, request_id = %request_id, "Plugin command timed out");
                Err(PlatformError::ReplyTimeout {
                    agent_id: agent_id.to_string(),
                    timeout: self.reply_timeout,
                })
            }
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REPLY_TIMEOUT)
    }
}

fn unexpected_reply(command: &str, reply: &PluginReply) -> PlatformError {
    PlatformError::Rpc(Status::internal(format!(
        "unexpected reply to {} command: {:?}",
        command, reply
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(registry: &AgentRegistry, agent_id: &str) -> (u64, mpsc::Receiver<std::result::Result<proto::ServerMessage, Status>>) {
        let (tx, rx) = mpsc::channel(8);
        let session_id = registry.next_session_id();
        registry.register(ConnectedAgent::new(
            session_id,
            proto::AgentRegister {
                agent_id: agent_id.to_string(),
                hostname: "host".to_string(),
                version: "0.1.0".to_string(),
            },
            tx,
        ));
        (session_id, rx)
    }

    #[tokio::test]
    async fn test_dispatch_to_unknown_agent() {
        let registry = AgentRegistry::default();
        let err = registry
            .dispatch_task("nobody", proto::TaskRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::AgentNotConnected(_)));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_outbound() {
        let registry = AgentRegistry::default();
        let (_, mut rx) = register(&registry, "a1");

        let task = proto::TaskRequest {
            task_id: "t1".into(),
            r#type: proto::TaskType::Shell as i32,
            script: "true".into(),
            timeout: 5,
        };
        registry.dispatch_task("a1", task.clone()).await.unwrap();

        let sent = rx.recv().await.unwrap().unwrap();
        assert_eq!(sent.message, Some(Message::TaskRequest(task)));
    }

    #[tokio::test]
    async fn test_stale_session_does_not_evict() {
        let registry = AgentRegistry::default();
        let (old_session, _old_rx) = register(&registry, "a1");
        let (new_session, _new_rx) = register(&registry, "a1");

        assert!(!registry.unregister("a1", old_session));
        assert!(registry.is_connected("a1"));

        assert!(registry.unregister("a1", new_session));
        assert!(!registry.is_connected("a1"));
    }

    #[tokio::test]
    async fn test_list_plugins_reply_correlation() {
        let registry = Arc::new(AgentRegistry::default());
        let (_, mut rx) = register(&registry, "a1");

        let caller = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.list_plugins("a1").await })
        };

        let sent = rx.recv().await.unwrap().unwrap();
        let Some(Message::ListPlugins(request)) = sent.message else {
            panic!("expected list request, got {:?}", sent.message);
        };

        assert!(!registry.complete("some-other-id", PluginReply::List(Default::default())));
        assert!(registry.complete(
            &request.request_id,
            PluginReply::List(proto::ListPluginsResponse {
                request_id: request.request_id.clone(),
                plugins: vec![proto::PluginInfo {
                    name: "cpu".into(),
                    version: "1.0.0".into(),
                    enabled: true,
                }],
            }),
        ));

        let plugins = caller.await.unwrap().unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].name, "cpu");
    }

    #[tokio::test]
    async fn test_pending_command_fails_when_session_closes() {
        let registry = Arc::new(AgentRegistry::default());
        let (session_id, mut rx) = register(&registry, "a1");

        let caller = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.uninstall_plugin("a1", "cpu").await })
        };
        rx.recv().await.unwrap().unwrap();

        registry.unregister("a1", session_id);
        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, PlatformError::SessionClosed));
    }

    #[tokio::test]
    async fn test_reply_timeout() {
        let registry = AgentRegistry::new(Duration::from_millis(100));
        let (_, _rx) = register(&registry, "a1");

        let err = registry
            .install_plugin("a1", "cpu", HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::ReplyTimeout { .. }));
        assert!(registry.pending.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_touch() {
        let registry = AgentRegistry::default();
        let (session_id, _rx) = register(&registry, "a1");
        assert!(registry.get("a1").unwrap().last_heartbeat.is_none());

        let now = Utc::now();
        registry.touch("a1", session_id, now);
        assert_eq!(registry.get("a1").unwrap().last_heartbeat, Some(now));
        assert_eq!(registry.list_agents().len(), 1);
    }
}
