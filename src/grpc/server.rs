// src/grpc/server.rs
//! Controller side of the agent session
//!
//! Every accepted `Session` call gets its own receive loop. The loop answers
//! registrations and heartbeats inline, hands task results to the store on a
//! separate task and routes plugin replies to waiting commands.

use crate::grpc::convert::{agent_message_kind, server_message};
use crate::grpc::proto::agent_service_server::{AgentService, AgentServiceServer};
use crate::grpc::proto::{self, agent_message, server_message::Message, AgentMessage, ServerMessage};
use crate::grpc::registry::{AgentRegistry, ConnectedAgent, Outbound, PluginReply};
use crate::grpc::store::ResultStore;
use crate::grpc::OUTBOUND_BUFFER;
use crate::observability::metrics::{Counter, MetricsSink};
use crate::runtime::TaskOutcome;
use crate::utils::errors::Result;
use chrono::Utc;
use futures::{Stream, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

/// gRPC service accepting agent sessions
#[derive(Clone)]
pub struct ControllerService {
    registry: Arc<AgentRegistry>,
    store: Arc<dyn ResultStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl ControllerService {
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<dyn ResultStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            registry,
            store,
            metrics,
        }
    }

    pub fn registry(&self) -> Arc<AgentRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn into_service(self) -> AgentServiceServer<Self> {
        AgentServiceServer::new(self)
    }

    /// Serve on `addr` until `shutdown` resolves
    pub async fn serve<F>(self, addr: SocketAddr, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Starting gRPC server on {}", addr);
        tonic::transport::Server::builder()
            .add_service(self.into_service())
            .serve_with_shutdown(addr, shutdown)
            .await?;
        info!("Server stopped gracefully");
        Ok(())
    }

    fn open_session(&self, outbound: Outbound) -> ControllerSession {
        ControllerSession {
            id: self.registry.next_session_id(),
            agent_id: None,
            outbound,
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

#[tonic::async_trait]
impl AgentService for ControllerService {
    type SessionStream = ReceiverStream<std::result::Result<ServerMessage, Status>>;

    async fn session(
        &self,
        request: Request<Streaming<AgentMessage>>,
    ) -> std::result::Result<Response<Self::SessionStream>, Status> {
        let remote = request.remote_addr();
        let inbound = request.into_inner();

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let session = self.open_session(tx);
        debug!(session = session.id, ?remote, "Session opened");

        tokio::spawn(session.run(inbound));

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// State of one accepted session
struct ControllerSession {
    id: u64,

    /// Set by the first successful registration
    agent_id: Option<String>,

    outbound: Outbound,
    registry: Arc<AgentRegistry>,
    store: Arc<dyn ResultStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl ControllerSession {
    async fn run<S>(mut self, mut inbound: S)
    where
        S: Stream<Item = std::result::Result<AgentMessage, Status>> + Unpin,
    {
        loop {
            match inbound.next().await {
                Some(Ok(message)) => self.dispatch(message).await,
                Some(Err(status)) => {
                    warn!(session = self.id, agent_id = ?self.agent_id, "Session ended abnormally: {}", status);
                    break;
                }
                None => {
                    info!(session = self.id, agent_id = ?self.agent_id, "Session closed by agent");
                    break;
                }
            }
        }

        if let Some(agent_id) = &self.agent_id {
            self.registry.unregister(agent_id, self.id);
        }
    }

    async fn dispatch(&mut self, message: AgentMessage) {
        let Some(message) = message.message else {
            warn!(session = self.id, "Ignoring empty agent message");
            self.metrics.incr(Counter::MalformedMessages);
            return;
        };
        debug!(session = self.id, kind = agent_message_kind(&message), "Received");

        match message {
            agent_message::Message::Register(register) => self.handle_register(register).await,
            agent_message::Message::Heartbeat(heartbeat) => self.handle_heartbeat(heartbeat).await,
            agent_message::Message::TaskResult(result) => self.handle_task_result(result),
            agent_message::Message::TaskLog(log) => {
                info!(task_id = %log.task_id, agent_id = ?self.agent_id, "Task log: {}", log.output);
            }
            agent_message::Message::InstallPluginResponse(response) => {
                let request_id = response.request_id.clone();
                self.route_reply(&request_id, PluginReply::Install(response));
            }
            agent_message::Message::UninstallPluginResponse(response) => {
                let request_id = response.request_id.clone();
                self.route_reply(&request_id, PluginReply::Uninstall(response));
            }
            agent_message::Message::ListPluginsResponse(response) => {
                let request_id = response.request_id.clone();
                self.route_reply(&request_id, PluginReply::List(response));
            }
        }
    }

    async fn handle_register(&mut self, register: proto::AgentRegister) {
        if register.agent_id.trim().is_empty() {
            warn!(session = self.id, "Rejecting registration without agent_id");
            self.send(Message::RegisterResponse(proto::Response {
                success: false,
                error: "agent_id is required".to_string(),
            }))
            .await;
            return;
        }

        if let Some(previous) = self.agent_id.take() {
            if previous != register.agent_id {
                self.registry.unregister(&previous, self.id);
            }
        }

        let agent_id = register.agent_id.clone();
        info!(agent_id = %agent_id, hostname = %register.hostname, version = %register.version, "Agent registered");

        self.registry
            .register(ConnectedAgent::new(self.id, register, self.outbound.clone()));
        self.agent_id = Some(agent_id);
        self.metrics.incr(Counter::AgentsRegistered);

        self.send(Message::RegisterResponse(proto::Response {
            success: true,
            error: String::new(),
        }))
        .await;
    }

    async fn handle_heartbeat(&mut self, heartbeat: proto::Heartbeat) {
        let agent_id = self.agent_id.as_deref().unwrap_or(&heartbeat.agent_id);
        debug!(agent_id, sent_at = heartbeat.timestamp, "Heartbeat");

        self.registry.touch(agent_id, self.id, Utc::now());
        self.metrics.incr(Counter::HeartbeatsAcked);

        self.send(Message::HeartbeatAck(proto::Response {
            success: true,
            error: String::new(),
        }))
        .await;
    }

    fn handle_task_result(&self, result: proto::TaskResult) {
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let agent_id = self.agent_id.clone();

        tokio::spawn(async move {
            let outcome = TaskOutcome::from(result);
            let task_id = outcome.task_id.clone();
            let exit_code = outcome.exit_code;

            match store.store_result(agent_id.as_deref(), outcome).await {
                Ok(()) => {
                    info!(task_id = %task_id, exit_code, agent_id = ?agent_id, "Task result stored");
                    metrics.incr(Counter::ResultsStored);
                }
                Err(e) => {
                    warn!(task_id = %task_id, agent_id = ?agent_id, "Failed to store task result: {}", e);
                    metrics.incr(Counter::StorageFailures);
                }
            }
        });
    }

    fn route_reply(&self, request_id: &str, reply: PluginReply) {
        if !self.registry.complete(request_id, reply) {
            warn!(agent_id = ?self.agent_id, request_id, "Plugin reply with no waiting command");
        }
    }

    async fn send(&self, message: Message) {
        if self.outbound.send(Ok(server_message(message))).await.is_err() {
            debug!(session = self.id, "Outbound stream closed");
        }
    }
}
