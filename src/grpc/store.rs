// src/grpc/store.rs
//! Boundary to the result persistence collaborator

use crate::runtime::TaskOutcome;
use crate::utils::errors::Result;
use async_trait::async_trait;
use dashmap::DashMap;

/// Where the controller records task results
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Store or overwrite the result for `result.task_id`
    async fn store_result(&self, agent_id: Option<&str>, result: TaskOutcome) -> Result<()>;
}

/// A recorded result and the agent that reported it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResult {
    pub agent_id: Option<String>,
    pub result: TaskOutcome,
}

/// Keeps results in memory, keyed by task id
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    results: DashMap<String, StoredResult>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, task_id: &str) -> Option<StoredResult> {
        self.results.get(task_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn store_result(&self, agent_id: Option<&str>, result: TaskOutcome) -> Result<()> {
        self.results.insert(
            result.task_id.clone(),
            StoredResult {
                agent_id: agent_id.map(str::to_string),
                result,
            },
        );
        Ok(())
    }
}
