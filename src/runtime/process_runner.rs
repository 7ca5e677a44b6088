// src/runtime/process_runner.rs
//! Runs one script under an interpreter and collects its output
//!
//! Supported interpreters:
//! - Shell (`sh -c`)
//! - Python (`python3 -c`)

use crate::utils::errors::{PlatformError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Interpreter selected for a script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    Shell,
    Python,
}

impl ScriptKind {
    /// Interpreter binary looked up in `PATH`
    pub fn command(&self) -> &'static str {
        match self {
            ScriptKind::Shell => "sh",
            ScriptKind::Python => "python3",
        }
    }

    /// Flag that makes the interpreter take the script inline
    pub fn inline_flag(&self) -> &'static str {
        "-c"
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptKind::Shell => "shell",
            ScriptKind::Python => "python",
        }
    }
}

impl FromStr for ScriptKind {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shell" => Ok(ScriptKind::Shell),
            "python" => Ok(ScriptKind::Python),
            other => Err(PlatformError::UnsupportedKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of a process that exited on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Spawns interpreter processes
///
/// Each child becomes the leader of its own process group so a timeout can
/// take down everything the script started.
#[derive(Debug, Default)]
pub struct ProcessRunner {
    /// Interpreter paths (cached)
    executable_paths: Mutex<HashMap<ScriptKind, PathBuf>>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the interpreter for a script kind
    fn find_executable(&self, kind: ScriptKind) -> Result<PathBuf> {
        if let Some(path) = self.executable_paths.lock().get(&kind) {
            return Ok(path.clone());
        }

        let command = kind.command();
        match which::which(command) {
            Ok(path) => {
                info!("Found {} at {:?}", command, path);
                self.executable_paths.lock().insert(kind, path.clone());
                Ok(path)
            }
            Err(e) => Err(PlatformError::ProcessSpawnFailed(format!(
                "executable '{}' not found in PATH: {}",
                command, e
            ))),
        }
    }

    /// Run `script` and wait for it, killing it after `timeout` if given
    ///
    /// A process that exits with any code yields `Ok`. A process that dies on
    /// a signal, including the timeout kill, yields `Err`.
    pub async fn execute(
        &self,
        kind: ScriptKind,
        script: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let executable = self.find_executable(kind)?;

        let mut command = Command::new(&executable);
        command
            .arg(kind.inline_flag())
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| PlatformError::ProcessSpawnFailed(format!("{}: {}", executable.display(), e)))?;

        let pid = child.id();
        debug!("Spawned {} process with PID {:?}", kind, pid);

        // covers callers that drop this future mid-run
        let mut group = GroupGuard(pid);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let collect = async {
            let (status, out, err) =
                tokio::join!(child.wait(), read_pipe(stdout), read_pipe(stderr));
            Ok::<_, std::io::Error>((status?, out?, err?))
        };

        let collected = match timeout {
            Some(limit) => tokio::time::timeout(limit, collect).await.ok(),
            None => Some(collect.await),
        };

        let Some(collected) = collected else {
            let limit = timeout.unwrap_or_default();
            warn!("Process {:?} exceeded {:?}, killing its process group", pid, limit);
            group.kill();
            // reap
            if let Err(e) = child.kill().await {
                debug!("Reaping timed out process failed: {}", e);
            }
            return Err(PlatformError::ExecutionTimeout(limit));
        };

        group.disarm();
        let (status, stdout, stderr) = collected?;

        match status.code() {
            Some(exit_code) => {
                debug!("Process {:?} exited with code {}", pid, exit_code);
                Ok(ExecutionResult {
                    exit_code,
                    stdout,
                    stderr,
                })
            }
            None => {
                let signal = status.signal().unwrap_or_default();
                debug!("Process {:?} terminated by signal {}", pid, signal);
                Err(PlatformError::Signaled(signal))
            }
        }
    }
}

/// Kills the process group on drop until the leader has been reaped
struct GroupGuard(Option<u32>);

impl GroupGuard {
    fn kill(&mut self) {
        if let Some(pid) = self.0.take() {
            kill_process_group(pid);
        }
    }

    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

/// SIGKILL every process in the group led by `pid`
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };

    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!("killpg({}) failed: {}", raw, e);
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
