//! Stdio transport: a spawned child process exchanging newline-delimited
//! JSON-RPC with the core.
//!
//! Requests are multiplexed: each in-flight call owns a request id and a
//! oneshot slot; a background reader task completes slots as responses
//! arrive. A response whose id matches no outstanding request is
//! rejected (logged and dropped).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use valet_domain::sysenv::StartupEnv;

use crate::protocol::{RpcNotification, RpcRequest, RpcResponse};

/// Non-JSON stdout lines tolerated before the server is declared broken.
const MAX_SKIP_LINES: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tool server process has exited")]
    ProcessExited,

    #[error("timed out waiting for response")]
    Timeout,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

pub struct StdioTransport {
    server_name: String,
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: tokio::sync::Mutex<Child>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawn the server process with a sanitized environment: the
    /// startup snapshot with `PATH` pinned, the project root appended to
    /// the module search path, and any configured extras.
    pub fn spawn(
        server_name: &str,
        command: &str,
        args: &[String],
        extra_env: &HashMap<String, String>,
        env: &StartupEnv,
        project_root: &std::path::Path,
    ) -> Result<Self, TransportError> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        cmd.env_clear();
        let extras: Vec<(&str, &str)> = extra_env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        for (key, value) in env.child_env(extras) {
            cmd.env(key, value);
        }
        // Servers written in Python import shared helpers from the
        // project root; append it to the module search path.
        let root = project_root.display().to_string();
        let pythonpath = match env.get("PYTHONPATH") {
            Some(existing) if !existing.is_empty() => format!("{existing}:{root}"),
            _ => root,
        };
        cmd.env("PYTHONPATH", pythonpath);

        let mut child = cmd.spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(
            server_name.to_string(),
            BufReader::new(stdout),
            pending.clone(),
            alive.clone(),
        ));

        Ok(Self {
            server_name: server_name.to_string(),
            stdin: tokio::sync::Mutex::new(stdin),
            child: tokio::sync::Mutex::new(child),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send a request and await its response, up to `timeout`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<RpcResponse, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::ProcessExited);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let req = RpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)?;
        tracing::debug!(server = %self.server_name, id, method, "sending request");

        if let Err(e) = self.write_line(&json).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            // Reader dropped the sender: the process died mid-call.
            Ok(Err(_)) => Err(TransportError::ProcessExited),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str) -> Result<(), TransportError> {
        let json = serde_json::to_string(&RpcNotification::new(method))?;
        self.write_line(&json).await
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::ProcessExited);
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Close stdin, give the process five seconds to exit, then kill it.
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.pending.lock().clear();

        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(server = %self.server_name, error = %e, "error closing stdin");
            }
        }

        let mut child = self.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server_name, ?status, "server process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %self.server_name, error = %e, "error waiting for server process");
            }
            Err(_) => {
                tracing::warn!(server = %self.server_name, "server did not exit in time, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(server = %self.server_name, error = %e, "failed to kill server process");
                }
            }
        }
    }
}

/// Background task: read stdout lines, complete pending requests.
async fn read_loop(
    server_name: String,
    mut stdout: BufReader<tokio::process::ChildStdout>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
) {
    let mut skipped = 0usize;
    loop {
        let mut line = String::new();
        match stdout.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !trimmed.starts_with('{') {
            skipped += 1;
            tracing::debug!(server = %server_name, line = %trimmed, "skipping non-JSON stdout line");
            if skipped >= MAX_SKIP_LINES {
                tracing::warn!(server = %server_name, "too many non-JSON lines, marking server dead");
                break;
            }
            continue;
        }
        match serde_json::from_str::<RpcResponse>(trimmed) {
            Ok(resp) => {
                let slot = pending.lock().remove(&resp.id);
                match slot {
                    Some(tx) => {
                        let _ = tx.send(resp);
                    }
                    None => {
                        // Unknown or already-expired id: reject.
                        tracing::warn!(
                            server = %server_name,
                            id = resp.id,
                            "response does not match an outstanding request, dropping"
                        );
                    }
                }
            }
            Err(_) => {
                // Likely a server-initiated notification; nothing awaits it.
                tracing::debug!(server = %server_name, line = %trimmed, "ignoring non-response message");
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    // Drop all pending senders so in-flight calls fail fast.
    pending.lock().clear();
    tracing::debug!(server = %server_name, "reader loop ended");
}
