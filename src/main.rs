// src/main.rs
//! Fleet Dispatch
//!
//! One binary for both ends of the session: `agent` dials a controller and
//! executes what it is sent, `controller` accepts agent sessions.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleet_dispatch::grpc::{AgentClient, AgentRegistry, ControllerService, InMemoryResultStore};
use fleet_dispatch::observability::{init_tracing, AtomicMetrics};
use fleet_dispatch::utils::config::{AgentConfig, ControllerConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "fleet-dispatch", version, about = "Remote task execution for agent fleets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to a controller and serve its commands
    Agent {
        /// YAML config file; FLEET_AGENT__* variables override it
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Accept agent sessions
    Controller {
        /// YAML config file; FLEET_CONTROLLER__* variables override it
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Agent { config } => run_agent(config.as_deref()).await,
        Command::Controller { config } => run_controller(config.as_deref()).await,
    }
}

async fn run_agent(path: Option<&str>) -> Result<()> {
    let config = AgentConfig::load(path).context("failed to load agent configuration")?;
    init_tracing(&config.log)?;

    info!("Starting fleet agent v{}", fleet_dispatch::VERSION);
    info!("Configuration loaded: {:?}", config);

    let metrics = Arc::new(AtomicMetrics::new());
    let client = AgentClient::new(config, metrics.clone());

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));

    let outcome = match client.connect().await {
        Ok(channel) => client.run(channel, shutdown).await,
        Err(e) => Err(e),
    };

    client.shutdown().await;
    info!("Agent counters: {:?}", metrics.snapshot().non_zero().collect::<Vec<_>>());

    match outcome {
        Ok(()) => {
            info!("Agent stopped");
            Ok(())
        }
        Err(e) => {
            error!("Agent session failed: {}", e);
            Err(e.into())
        }
    }
}

async fn run_controller(path: Option<&str>) -> Result<()> {
    let config =
        ControllerConfig::load(path).context("failed to load controller configuration")?;
    init_tracing(&config.log)?;

    info!("Starting fleet controller v{}", fleet_dispatch::VERSION);
    info!("Configuration loaded: {:?}", config);

    let addr = config.listen_addr()?;
    let registry = Arc::new(AgentRegistry::new(config.plugin_command_timeout()));
    let store = Arc::new(InMemoryResultStore::new());
    let metrics = Arc::new(AtomicMetrics::new());

    let service = ControllerService::new(registry, store, metrics.clone());

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));

    let served = service.serve(addr, shutdown.cancelled_owned()).await;
    info!("Controller counters: {:?}", metrics.snapshot().non_zero().collect::<Vec<_>>());

    served.map_err(|e| {
        error!("Server error: {}", e);
        e.into()
    })
}

async fn cancel_on_ctrl_c(token: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for CTRL+C: {}", e);
        return;
    }
    info!("Received shutdown signal, cleaning up...");
    token.cancel();
}
