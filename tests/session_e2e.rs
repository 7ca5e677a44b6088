// tests/session_e2e.rs
//! A real controller and a real agent talking over loopback

use fleet_dispatch::grpc::proto;
use fleet_dispatch::grpc::{AgentClient, AgentRegistry, ControllerService, InMemoryResultStore};
use fleet_dispatch::observability::{AtomicMetrics, NoopMetrics};
use fleet_dispatch::runtime::EXIT_CODE_NOT_RUN;
use fleet_dispatch::utils::config::AgentConfig;
use fleet_dispatch::Result;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

const AGENT_ID: &str = "agent-e2e";

struct Fleet {
    registry: Arc<AgentRegistry>,
    store: Arc<InMemoryResultStore>,
    agent_shutdown: CancellationToken,
    agent: JoinHandle<Result<()>>,
    controller_shutdown: CancellationToken,
    data_dir: TempDir,
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.agent_shutdown.cancel();
        self.controller_shutdown.cancel();
    }
}

async fn start_fleet() -> Fleet {
    let registry = Arc::new(AgentRegistry::new(Duration::from_secs(10)));
    let store = Arc::new(InMemoryResultStore::new());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let service = ControllerService::new(
        registry.clone(),
        store.clone(),
        Arc::new(NoopMetrics),
    );
    let controller_shutdown = CancellationToken::new();
    tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(service.into_service())
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                controller_shutdown.clone().cancelled_owned(),
            ),
    );

    let data_dir = TempDir::new().unwrap();
    let mut config = AgentConfig::default();
    config.server.address = format!("http://{}", addr);
    config.agent.id = AGENT_ID.to_string();
    config.agent.data_dir = data_dir.path().to_path_buf();
    config.agent.heartbeat_interval_secs = 1;

    let client = Arc::new(AgentClient::new(config, Arc::new(AtomicMetrics::new())));
    let channel = client.connect().await.unwrap();

    let agent_shutdown = CancellationToken::new();
    let agent = {
        let client = client.clone();
        let shutdown = agent_shutdown.clone();
        tokio::spawn(async move {
            let result = client.run(channel, shutdown).await;
            client.shutdown().await;
            result
        })
    };

    let fleet = Fleet {
        registry,
        store,
        agent_shutdown,
        agent,
        controller_shutdown,
        data_dir,
    };
    eventually(|| fleet.registry.is_connected(AGENT_ID).then_some(())).await;
    fleet
}

async fn eventually<T>(mut check: impl FnMut() -> Option<T>) -> T {
    for _ in 0..200 {
        if let Some(value) = check() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met within 10s");
}

fn shell_task(task_id: &str, script: &str) -> proto::TaskRequest {
    proto::TaskRequest {
        task_id: task_id.to_string(),
        r#type: proto::TaskType::Shell as i32,
        script: script.to_string(),
        timeout: 10,
    }
}

fn install_echo_plugin(data_dir: &Path) {
    let dir = data_dir.join("plugins").join("echo");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("echo");
    std::fs::write(&path, "#!/bin/sh\nwhile read line; do echo \"$line\"; done\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[tokio::test]
async fn test_task_round_trip() {
    let fleet = start_fleet().await;

    let snapshot = fleet.registry.get(AGENT_ID).unwrap();
    assert_eq!(snapshot.version, fleet_dispatch::VERSION);

    fleet
        .registry
        .dispatch_task(AGENT_ID, shell_task("t1", "echo hello"))
        .await
        .unwrap();

    let stored = eventually(|| fleet.store.get("t1")).await;
    assert_eq!(stored.agent_id.as_deref(), Some(AGENT_ID));
    assert_eq!(stored.result.exit_code, 0);
    assert_eq!(stored.result.stdout, "hello\n");
    assert_eq!(stored.result.stderr, "");
}

#[tokio::test]
async fn test_concurrent_tasks_are_correlated() {
    let fleet = start_fleet().await;

    fleet
        .registry
        .dispatch_task(AGENT_ID, shell_task("slow", "sleep 1; echo slow"))
        .await
        .unwrap();
    fleet
        .registry
        .dispatch_task(AGENT_ID, shell_task("fast", "echo fast"))
        .await
        .unwrap();

    let fast = eventually(|| fleet.store.get("fast")).await;
    assert!(fleet.store.get("slow").is_none());
    assert_eq!(fast.result.stdout, "fast\n");

    let slow = eventually(|| fleet.store.get("slow")).await;
    assert_eq!(slow.result.stdout, "slow\n");
}

#[tokio::test]
async fn test_unsupported_type_answers_not_run() {
    let fleet = start_fleet().await;

    let mut task = shell_task("t1", "true");
    task.r#type = proto::TaskType::Unspecified as i32;
    fleet.registry.dispatch_task(AGENT_ID, task).await.unwrap();

    let stored = eventually(|| fleet.store.get("t1")).await;
    assert_eq!(stored.result.exit_code, EXIT_CODE_NOT_RUN);
    assert!(!stored.result.stderr.is_empty());
}

#[tokio::test]
async fn test_heartbeats_are_recorded() {
    let fleet = start_fleet().await;

    eventually(|| fleet.registry.get(AGENT_ID).and_then(|agent| agent.last_heartbeat)).await;
}

#[tokio::test]
async fn test_plugin_commands() {
    let fleet = start_fleet().await;
    install_echo_plugin(fleet.data_dir.path());

    let mut config = HashMap::new();
    config.insert("interval".to_string(), "5".to_string());
    let installed = fleet
        .registry
        .install_plugin(AGENT_ID, "echo", config)
        .await
        .unwrap();
    assert!(installed.success, "{:?}", installed.error);
    assert_eq!(installed.plugin_name, "echo");

    let again = fleet
        .registry
        .install_plugin(AGENT_ID, "echo", HashMap::new())
        .await
        .unwrap();
    assert!(!again.success);
    assert!(again.error.is_some());

    let plugins = fleet.registry.list_plugins(AGENT_ID).await.unwrap();
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0].name, "echo");
    assert!(plugins[0].enabled);

    let removed = fleet.registry.uninstall_plugin(AGENT_ID, "echo").await.unwrap();
    assert!(removed.success, "{:?}", removed.error);
    assert!(fleet.registry.list_plugins(AGENT_ID).await.unwrap().is_empty());

    let missing = fleet.registry.uninstall_plugin(AGENT_ID, "echo").await.unwrap();
    assert!(!missing.success);
}

#[tokio::test]
async fn test_agent_shutdown_unregisters() {
    let mut fleet = start_fleet().await;

    fleet.agent_shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(10), &mut fleet.agent)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());

    eventually(|| (!fleet.registry.is_connected(AGENT_ID)).then_some(())).await;
}
