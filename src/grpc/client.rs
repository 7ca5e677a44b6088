// src/grpc/client.rs
//! Agent side of the session
//!
//! The agent dials the controller, registers, then serves commands until the
//! stream ends. Every command runs on its own task; all replies funnel
//! through one outbound channel that feeds the request stream.

use crate::grpc::convert::{
    agent_message, agent_message_kind, config_document, response, script_kind,
    server_message_kind, timeout_secs,
};
use crate::grpc::proto::agent_service_client::AgentServiceClient;
use crate::grpc::proto::{self, agent_message::Message, server_message, AgentMessage, ServerMessage};
use crate::grpc::OUTBOUND_BUFFER;
use crate::observability::metrics::{Counter, MetricsSink};
use crate::runtime::{Plugin, PluginManager, TaskExecutor};
use crate::utils::config::AgentConfig;
use crate::utils::errors::{PlatformError, Result};
use crate::VERSION;
use chrono::Utc;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::Status;
use tracing::{debug, info, warn};

/// Long-running agent process state
pub struct AgentClient {
    config: AgentConfig,
    executor: Arc<TaskExecutor>,
    plugins: Arc<PluginManager>,
    metrics: Arc<dyn MetricsSink>,
}

impl AgentClient {
    pub fn new(config: AgentConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let executor = Arc::new(TaskExecutor::with_capacity(
            config.agent.max_concurrent_tasks,
            Arc::clone(&metrics),
        ));
        let plugins = Arc::new(PluginManager::new(
            config.agent.data_dir.clone(),
            Arc::clone(&metrics),
        ));

        Self {
            config,
            executor,
            plugins,
            metrics,
        }
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.plugins
    }

    /// Open a channel to the controller, bounded by the connect timeout
    pub async fn connect(&self) -> Result<Channel> {
        let address = self.config.server.address.clone();
        let deadline = self.config.connect_timeout();

        let mut endpoint = Endpoint::from_shared(address.clone())
            .map_err(|e| PlatformError::Config(format!("invalid server address {}: {}", address, e)))?
            .connect_timeout(deadline);
        if self.config.server.tls {
            endpoint = endpoint.tls_config(ClientTlsConfig::new())?;
        }

        info!("Connecting to controller at {}", address);
        let channel = tokio::time::timeout(deadline, endpoint.connect())
            .await
            .map_err(|_| PlatformError::ConnectTimeout(address.clone()))??;

        Ok(channel)
    }

    /// Register and serve one session until it ends or `shutdown` fires
    ///
    /// A clean close from either side returns `Ok`. Nothing is retried.
    pub async fn run(&self, channel: Channel, shutdown: CancellationToken) -> Result<()> {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let uplink = Uplink(tx);

        // Queued ahead of the stream so it is the first message on the wire
        uplink
            .send(Message::Register(proto::AgentRegister {
                agent_id: self.config.agent.id.clone(),
                hostname: local_hostname(),
                version: VERSION.to_string(),
            }))
            .await;

        let mut client = AgentServiceClient::new(channel);
        let inbound = client.session(ReceiverStream::new(rx)).await?.into_inner();
        info!(agent_id = %self.config.agent.id, "Session established");

        let session = AgentSession {
            agent_id: self.config.agent.id.clone(),
            uplink,
            executor: Arc::clone(&self.executor),
            plugins: Arc::clone(&self.plugins),
            metrics: Arc::clone(&self.metrics),
            cancel: shutdown.child_token(),
        };
        session.run(inbound, self.config.heartbeat_interval()).await
    }

    /// Stop every plugin this agent started
    pub async fn shutdown(&self) {
        info!("Stopping plugins");
        self.plugins.stop_all().await;
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Single serialized path to the controller
#[derive(Clone)]
struct Uplink(mpsc::Sender<AgentMessage>);

impl Uplink {
    /// False when the session is gone and the message was dropped
    async fn send(&self, message: Message) -> bool {
        let kind = agent_message_kind(&message);
        let sent = self.0.send(agent_message(message)).await.is_ok();
        if !sent {
            warn!(kind, "Session closed, dropping outbound message");
        }
        sent
    }
}

/// Per-connection handler state, cloned into every spawned handler
#[derive(Clone)]
struct AgentSession {
    agent_id: String,
    uplink: Uplink,
    executor: Arc<TaskExecutor>,
    plugins: Arc<PluginManager>,
    metrics: Arc<dyn MetricsSink>,

    /// Cancelled when the session ends; abandons in-flight handlers
    cancel: CancellationToken,
}

impl AgentSession {
    async fn run<S>(self, mut inbound: S, heartbeat_interval: Duration) -> Result<()>
    where
        S: Stream<Item = std::result::Result<ServerMessage, Status>> + Unpin,
    {
        let heartbeat = tokio::spawn(self.clone().heartbeat_loop(heartbeat_interval));

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Session shutting down");
                    break Ok(());
                }
                next = inbound.next() => match next {
                    Some(Ok(message)) => self.dispatch(message),
                    Some(Err(status)) => {
                        warn!("Session stream failed: {}", status);
                        break Err(PlatformError::from(status));
                    }
                    None => {
                        info!("Controller closed the session");
                        break Ok(());
                    }
                }
            }
        };

        self.cancel.cancel();
        if let Err(e) = heartbeat.await {
            warn!("Heartbeat task ended abnormally: {}", e);
        }
        result
    }

    async fn heartbeat_loop(self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let sent = self
                        .uplink
                        .send(Message::Heartbeat(proto::Heartbeat {
                            agent_id: self.agent_id.clone(),
                            timestamp: Utc::now().timestamp(),
                        }))
                        .await;
                    if sent {
                        self.metrics.incr(Counter::HeartbeatsSent);
                    }
                }
            }
        }
    }

    fn dispatch(&self, message: ServerMessage) {
        let Some(message) = message.message else {
            warn!("Ignoring empty server message");
            self.metrics.incr(Counter::MalformedMessages);
            return;
        };
        debug!(kind = server_message_kind(&message), "Received");

        match message {
            server_message::Message::RegisterResponse(r) if r.success => {
                info!(agent_id = %self.agent_id, "Registered with controller");
            }
            server_message::Message::RegisterResponse(r) => {
                warn!(agent_id = %self.agent_id, "Registration rejected: {}", r.error);
            }
            server_message::Message::HeartbeatAck(_) => debug!("Heartbeat acknowledged"),
            server_message::Message::TaskRequest(request) => {
                self.spawn_handler(self.clone().handle_task(request))
            }
            server_message::Message::InstallPlugin(request) => {
                self.spawn_handler(self.clone().handle_install(request))
            }
            server_message::Message::UninstallPlugin(request) => {
                self.spawn_handler(self.clone().handle_uninstall(request))
            }
            server_message::Message::ListPlugins(request) => {
                self.spawn_handler(self.clone().handle_list(request))
            }
        }
    }

    fn spawn_handler<F>(&self, handler: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!("Handler abandoned"),
                _ = handler => {}
            }
        });
    }

    async fn handle_task(self, request: proto::TaskRequest) {
        info!(task_id = %request.task_id, "Executing task");

        let outcome = self
            .executor
            .run_task(
                &request.task_id,
                script_kind(request.r#type),
                &request.script,
                timeout_secs(request.timeout),
                &self.cancel,
            )
            .await;

        info!(task_id = %outcome.task_id, exit_code = outcome.exit_code, "Task finished");
        self.uplink.send(Message::TaskResult(outcome.into())).await;
    }

    async fn handle_install(self, request: proto::InstallPluginRequest) {
        let name = request.plugin_name;
        let result = self.install(&name, request.config).await;

        match &result {
            Ok(()) => {
                info!(plugin = %name, "Plugin installed");
                match self.plugins.plugin(&name).await {
                    Ok(plugin) => self.watch_plugin(plugin),
                    Err(e) => warn!(plugin = %name, "Plugin vanished before watching: {}", e),
                }
            }
            Err(e) => warn!(plugin = %name, "Plugin install failed: {}", e),
        }

        let body = response(&result);
        self.uplink
            .send(Message::InstallPluginResponse(proto::InstallPluginResponse {
                request_id: request.request_id,
                plugin_name: name,
                success: body.success,
                error: body.error,
            }))
            .await;
    }

    /// Load, start and configure; a failed start or config leaves nothing behind
    async fn install(&self, name: &str, config: HashMap<String, String>) -> Result<()> {
        self.plugins.load(name).await?;

        if let Err(e) = self.plugins.start(name).await {
            self.roll_back(name).await;
            return Err(e);
        }

        if !config.is_empty() {
            if let Err(e) = self.plugins.send_config(name, config_document(config)).await {
                self.roll_back(name).await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn roll_back(&self, name: &str) {
        if let Err(e) = self.plugins.unload(name).await {
            warn!(plugin = %name, "Failed to roll back plugin: {}", e);
        }
    }

    /// Drain one plugin instance's output until its channel closes
    ///
    /// Bound to the instance, so a reinstall under the same name gets its
    /// own watcher and this one ends when the old process stops.
    fn watch_plugin(&self, plugin: Arc<Plugin>) {
        let plugins = Arc::clone(&self.plugins);

        tokio::spawn(async move {
            let name = plugin.name();
            loop {
                match plugins.read_from(&plugin).await {
                    Ok(message) => debug!(plugin = %name, ?message, "Plugin output"),
                    Err(PlatformError::PluginProtocol { reason, .. }) => {
                        warn!(plugin = %name, "Skipping malformed plugin output: {}", reason);
                    }
                    Err(e) => {
                        debug!(plugin = %name, "Plugin output watcher stopped: {}", e);
                        break;
                    }
                }
            }
        });
    }

    async fn handle_uninstall(self, request: proto::UninstallPluginRequest) {
        let result = self.plugins.unload(&request.plugin_name).await;
        match &result {
            Ok(()) => info!(plugin = %request.plugin_name, "Plugin uninstalled"),
            Err(e) => warn!(plugin = %request.plugin_name, "Plugin uninstall failed: {}", e),
        }

        let body = response(&result);
        self.uplink
            .send(Message::UninstallPluginResponse(proto::UninstallPluginResponse {
                request_id: request.request_id,
                plugin_name: request.plugin_name,
                success: body.success,
                error: body.error,
            }))
            .await;
    }

    async fn handle_list(self, request: proto::ListPluginsRequest) {
        let plugins = self
            .plugins
            .list()
            .await
            .into_iter()
            .map(proto::PluginInfo::from)
            .collect();

        self.uplink
            .send(Message::ListPluginsResponse(proto::ListPluginsResponse {
                request_id: request.request_id,
                plugins,
            }))
            .await;
    }
}
