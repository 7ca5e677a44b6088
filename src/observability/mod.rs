// src/observability/mod.rs
//! Logging setup and the injected metrics sink

pub mod metrics;

pub use metrics::{AtomicMetrics, Counter, MetricsSink, MetricsSnapshot, NoopMetrics};

use crate::utils::config::{LogConfig, LogFormat};
use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level when it is set.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };

    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}
