// src/observability/metrics.rs
//! Counter sink injected into the executor, plugin runtime and sessions
//!
//! Components never reach for a global registry; whoever builds them hands
//! over an `Arc<dyn MetricsSink>`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Every counter the core reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Counter {
    TasksReceived,
    TasksSucceeded,
    TasksFailed,
    TasksCancelled,
    PluginsStarted,
    PluginsStopped,
    PluginMessages,
    HeartbeatsSent,
    HeartbeatsAcked,
    AgentsRegistered,
    ResultsStored,
    StorageFailures,
    MalformedMessages,
}

impl Counter {
    pub const ALL: [Counter; 13] = [
        Counter::TasksReceived,
        Counter::TasksSucceeded,
        Counter::TasksFailed,
        Counter::TasksCancelled,
        Counter::PluginsStarted,
        Counter::PluginsStopped,
        Counter::PluginMessages,
        Counter::HeartbeatsSent,
        Counter::HeartbeatsAcked,
        Counter::AgentsRegistered,
        Counter::ResultsStored,
        Counter::StorageFailures,
        Counter::MalformedMessages,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Counter::TasksReceived => "tasks_received",
            Counter::TasksSucceeded => "tasks_succeeded",
            Counter::TasksFailed => "tasks_failed",
            Counter::TasksCancelled => "tasks_cancelled",
            Counter::PluginsStarted => "plugins_started",
            Counter::PluginsStopped => "plugins_stopped",
            Counter::PluginMessages => "plugin_messages",
            Counter::HeartbeatsSent => "heartbeats_sent",
            Counter::HeartbeatsAcked => "heartbeats_acked",
            Counter::AgentsRegistered => "agents_registered",
            Counter::ResultsStored => "results_stored",
            Counter::StorageFailures => "storage_failures",
            Counter::MalformedMessages => "malformed_messages",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Destination for counter increments
pub trait MetricsSink: Send + Sync {
    fn add(&self, counter: Counter, value: u64);

    fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }
}

/// Lock-free in-process counters
#[derive(Debug, Default)]
pub struct AtomicMetrics {
    counters: [AtomicU64; Counter::ALL.len()],
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let values = Counter::ALL
            .iter()
            .map(|c| (c.name(), self.get(*c)))
            .collect();
        MetricsSnapshot { values }
    }
}

impl MetricsSink for AtomicMetrics {
    fn add(&self, counter: Counter, value: u64) {
        self.counters[counter.index()].fetch_add(value, Ordering::Relaxed);
    }
}

/// Counter values keyed by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub values: BTreeMap<&'static str, u64>,
}

impl MetricsSnapshot {
    pub fn get(&self, name: &str) -> u64 {
        self.values.get(name).copied().unwrap_or(0)
    }

    /// Names with a non-zero value
    pub fn non_zero(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.values
            .iter()
            .filter(|(_, v)| **v > 0)
            .map(|(k, v)| (*k, *v))
    }
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn add(&self, _counter: Counter, _value: u64) {}
}
