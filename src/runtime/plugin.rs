// src/runtime/plugin.rs
//! A single plugin helper process and its JSON line channel
//!
//! While running, the plugin owns its child process, the write end of the
//! child's stdin and the read end of its stdout. `stop` releases all three
//! together. The plugin leads its own process group, and stopping it signals
//! the whole group.

use crate::utils::errors::{PlatformError, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Version reported for plugins that do not announce one
pub const DEFAULT_PLUGIN_VERSION: &str = "1.0.0";

/// How long a plugin gets to exit after SIGTERM before SIGKILL
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

const SPAWN_BUSY_RETRIES: u32 = 5;

/// Open key-value document exchanged with plugins
pub type Document = Map<String, Value>;

/// Public descriptor of a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,

    /// True only while the process is running
    pub enabled: bool,
}

/// Process handles held while running
struct PluginProcess {
    child: Child,
    stdin: ChildStdin,

    /// Shared with the output slot of the same run
    closed: CancellationToken,
}

/// Read side of one run
struct PluginOutput {
    reader: BufReader<ChildStdout>,

    /// Fired by `stop` so a blocked reader lets go of the pipe
    closed: CancellationToken,
}

/// A managed plugin
pub struct Plugin {
    info: parking_lot::RwLock<PluginInfo>,

    executable: PathBuf,

    /// Child and stdin writer; also serializes start/stop/send
    process: Mutex<Option<PluginProcess>>,

    /// stdout reader, separate so a blocked read does not hold up stop
    output: Mutex<Option<PluginOutput>>,

    /// Last configuration sent
    config: parking_lot::Mutex<Document>,
}

impl Plugin {
    /// Plugin whose executable lives at `<data_dir>/plugins/<name>/<name>`
    pub fn new(name: &str, data_dir: &Path) -> Self {
        Self {
            info: parking_lot::RwLock::new(PluginInfo {
                name: name.to_string(),
                version: DEFAULT_PLUGIN_VERSION.to_string(),
                enabled: false,
            }),
            executable: executable_path(data_dir, name),
            process: Mutex::new(None),
            output: Mutex::new(None),
            config: parking_lot::Mutex::new(Document::new()),
        }
    }

    pub fn name(&self) -> String {
        self.info.read().name.clone()
    }

    pub fn info(&self) -> PluginInfo {
        self.info.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.info.read().enabled
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Last configuration document sent to the plugin
    pub fn config(&self) -> Document {
        self.config.lock().clone()
    }

    /// Spawn the plugin process and wire its pipes
    pub async fn start(&self) -> Result<()> {
        let mut process = self.process.lock().await;
        let name = self.name();

        if process.is_some() {
            return Err(PlatformError::PluginAlreadyRunning(name));
        }

        debug!("Spawning plugin {} from {:?}", name, self.executable);

        let mut child = self.spawn().await.map_err(|e| {
            PlatformError::ProcessSpawnFailed(format!(
                "plugin {} ({}): {}",
                name,
                self.executable.display(),
                e
            ))
        })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill().await;
                return Err(PlatformError::ProcessSpawnFailed(format!(
                    "plugin {}: failed to capture stdio",
                    name
                )));
            }
        };

        info!("Plugin {} started with PID {:?}", name, child.id());

        let closed = CancellationToken::new();
        *self.output.lock().await = Some(PluginOutput {
            reader: BufReader::new(stdout),
            closed: closed.clone(),
        });
        *process = Some(PluginProcess {
            child,
            stdin,
            closed,
        });
        self.info.write().enabled = true;

        Ok(())
    }

    /// Spawn the executable, retrying while a fresh install is still open for writing
    async fn spawn(&self) -> std::io::Result<Child> {
        let mut attempt = 0;
        loop {
            let spawned = Command::new(&self.executable)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .process_group(0)
                .kill_on_drop(true)
                .spawn();

            match spawned {
                Err(e) if e.raw_os_error() == Some(nix::errno::Errno::ETXTBSY as i32)
                    && attempt < SPAWN_BUSY_RETRIES =>
                {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                other => return other,
            }
        }
    }

    /// Close stdin, terminate the process and reap it
    ///
    /// Stopping a plugin that is not running succeeds without doing anything.
    pub async fn stop(&self) -> Result<()> {
        let mut process = self.process.lock().await;

        let Some(PluginProcess {
            mut child,
            stdin,
            closed,
        }) = process.take()
        else {
            return Ok(());
        };
        let name = self.name();
        self.info.write().enabled = false;

        // release a reader blocked on the pipe before anything else
        closed.cancel();
        drop(stdin);

        let pid = child.id();
        if let Some(pid) = pid {
            signal_group(pid, Signal::SIGTERM);
        }

        let waited = match tokio::time::timeout(STOP_GRACE_PERIOD, child.wait()).await {
            Ok(status) => status.map(Some),
            Err(_) => {
                warn!("Plugin {} ignored SIGTERM, sending SIGKILL", name);
                child.kill().await.map(|_| None)
            }
        };

        // descendants that outlived the leader
        if let Some(pid) = pid {
            signal_group(pid, Signal::SIGKILL);
        }

        *self.output.lock().await = None;

        match waited {
            Ok(Some(status)) => {
                info!("Plugin {} stopped ({})", name, status);
                Ok(())
            }
            Ok(None) => {
                info!("Plugin {} killed", name);
                Ok(())
            }
            Err(e) => Err(PlatformError::Io(e)),
        }
    }

    /// Write `{"type":"config","data":config}` as one line to the plugin
    pub async fn send_config(&self, config: Document) -> Result<()> {
        let mut process = self.process.lock().await;
        let Some(running) = process.as_mut() else {
            return Err(PlatformError::PluginNotRunning(self.name()));
        };

        let mut line = serde_json::to_vec(&serde_json::json!({
            "type": "config",
            "data": &config,
        }))?;
        line.push(b'\n');

        running.stdin.write_all(&line).await?;
        running.stdin.flush().await?;

        *self.config.lock() = config;
        Ok(())
    }

    /// Read one newline-terminated JSON object from the plugin
    pub async fn read_data(&self) -> Result<Document> {
        let mut output = self.output.lock().await;
        let Some(output) = output.as_mut() else {
            return Err(PlatformError::PluginNotRunning(self.name()));
        };

        let mut line = String::new();
        let read = tokio::select! {
            _ = output.closed.cancelled() => 0,
            read = output.reader.read_line(&mut line) => read?,
        };
        if read == 0 {
            return Err(PlatformError::PluginChannelClosed(self.name()));
        }

        parse_message(&line).map_err(|reason| PlatformError::PluginProtocol {
            name: self.name(),
            reason,
        })
    }
}

/// `<data_dir>/plugins/<name>/<name>`
pub fn executable_path(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join("plugins").join(name).join(name)
}

fn parse_message(line: &str) -> std::result::Result<Document, String> {
    match serde_json::from_str::<Value>(line.trim_end()) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {}", other)),
        Err(e) => Err(e.to_string()),
    }
}

/// Signal every process in the group led by `pid`
fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };

    debug!("Sending {:?} to process group {}", signal, raw);
    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        debug!("{:?} to group {} failed: {}", signal, raw, e);
    }
}
