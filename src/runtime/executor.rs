// src/runtime/executor.rs
//! Task executor with a bounded admission gate
//!
//! At most `capacity` scripts run at once. Further callers wait for a slot
//! (backpressure) or give up when their cancellation token fires.
//!
//! ```text
//! TaskExecutor
//! ├─ Gate: Semaphore(capacity)     (default 5)
//! ├─ Runner: ProcessRunner         (spawn, collect, timeout)
//! └─ Waiters: [call, call, ...]    (blocked on a permit)
//! ```

use crate::observability::metrics::{Counter, MetricsSink};
use crate::runtime::process_runner::{ExecutionResult, ProcessRunner, ScriptKind};
use crate::utils::errors::{PlatformError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default admission gate capacity
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Exit code reported when a task could not run to completion
pub const EXIT_CODE_NOT_RUN: i32 = -1;

/// What the agent reports back for one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub task_id: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl TaskOutcome {
    /// Fold an execution attempt into an answer
    ///
    /// Errors become `exit_code = -1` with the error text in `stderr`.
    pub fn from_execution(task_id: impl Into<String>, execution: Result<ExecutionResult>) -> Self {
        let task_id = task_id.into();
        match execution {
            Ok(result) => Self {
                task_id,
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
            },
            Err(e) => Self {
                task_id,
                exit_code: EXIT_CODE_NOT_RUN,
                stdout: String::new(),
                stderr: e.to_string(),
            },
        }
    }
}

/// Concurrency-gated script executor
pub struct TaskExecutor {
    runner: ProcessRunner,

    /// Admission gate
    gate: Arc<Semaphore>,

    capacity: usize,

    metrics: Arc<dyn MetricsSink>,
}

impl TaskExecutor {
    /// Create an executor with the default capacity
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self::with_capacity(DEFAULT_MAX_CONCURRENT, metrics)
    }

    pub fn with_capacity(capacity: usize, metrics: Arc<dyn MetricsSink>) -> Self {
        info!("Initializing task executor with {} slots", capacity);

        Self {
            runner: ProcessRunner::new(),
            gate: Arc::new(Semaphore::new(capacity)),
            capacity,
            metrics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently held by a running script
    pub fn available_slots(&self) -> usize {
        self.gate.available_permits()
    }

    /// Run a script once a slot is free
    ///
    /// `timeout_secs == 0` means no limit. If `cancel` fires while waiting
    /// for a slot the call fails with `Cancelled` and nothing is spawned.
    pub async fn execute(
        &self,
        kind: ScriptKind,
        script: &str,
        timeout_secs: u64,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Cancelled while waiting for an executor slot");
                return Err(PlatformError::Cancelled);
            }
            permit = self.gate.acquire() => permit.map_err(|_| PlatformError::Cancelled)?,
        };

        let timeout = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));
        self.runner.execute(kind, script, timeout).await
    }

    /// Execute a task and always produce an outcome for it
    pub async fn run_task(
        &self,
        task_id: &str,
        kind: Result<ScriptKind>,
        script: &str,
        timeout_secs: u64,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        self.metrics.incr(Counter::TasksReceived);

        let execution = match kind {
            Ok(kind) => self.execute(kind, script, timeout_secs, cancel).await,
            Err(e) => Err(e),
        };

        match &execution {
            Ok(result) if result.success() => self.metrics.incr(Counter::TasksSucceeded),
            Ok(result) => {
                debug!(task_id, exit_code = result.exit_code, "Task exited non-zero");
                self.metrics.incr(Counter::TasksFailed);
            }
            Err(PlatformError::Cancelled) => self.metrics.incr(Counter::TasksCancelled),
            Err(e) => {
                if e.is_not_run() {
                    warn!(task_id, error = %e, "Task did not run");
                } else {
                    warn!(task_id, error = %e, "Task did not complete");
                }
                self.metrics.incr(Counter::TasksFailed);
            }
        }

        TaskOutcome::from_execution(task_id, execution)
    }
}
