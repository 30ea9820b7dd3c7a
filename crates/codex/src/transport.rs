//! Stdio JSON-RPC transport to a locally spawned Codex app-server child
//! process. Owns a single background reader task that demultiplexes the
//! child's stdout into responses (matched to outstanding requests by id),
//! notifications (fanned out on a broadcast channel), and inbound server
//! requests (dispatched to a [`ServerRequestHandler`]).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{broadcast, oneshot, Mutex, Notify};

use crate::protocol::{
    InboundMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    UNSUPPORTED_SERVER_REQUEST,
};

const STDERR_TAIL_LINES: usize = 50;
const MAX_NON_JSON_STDOUT_LINES: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum CodexError {
    #[error("failed to spawn codex binary {binary:?}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("codex transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codex JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("timed out waiting for a response to {0}")]
    Timeout(String),
    #[error("codex process exited: {diagnostic}")]
    Exited { diagnostic: String },
    #[error("codex request failed: {0}")]
    Rpc(#[from] JsonRpcError),
    #[error("codex turn cancelled")]
    Cancelled,
}

pub type CodexResult<T> = Result<T, CodexError>;

/// A notification received from the child, fanned out to every subscriber.
#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// Handles inbound requests initiated by the child (the "server role" the
/// spec describes: approval prompts, token-refresh prompts).
#[async_trait]
pub trait ServerRequestHandler: Send + Sync {
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError>;
}

/// Default handler: declines `requestApproval` (tool integration not yet
/// wired on this side) and rejects everything else as unsupported.
pub struct DeclineApprovals;

#[async_trait]
impl ServerRequestHandler for DeclineApprovals {
    async fn handle(&self, method: &str, _params: Option<Value>) -> Result<Value, JsonRpcError> {
        if method == "requestApproval" {
            Ok(serde_json::json!({ "decision": "deny" }))
        } else {
            Err(JsonRpcError {
                code: UNSUPPORTED_SERVER_REQUEST,
                message: "Unsupported server request".into(),
                data: None,
            })
        }
    }
}

struct ExitState {
    diagnostic: String,
}

/// A stdio-connected Codex app-server process.
pub struct CodexTransport {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    next_id: AtomicU64,
    pending: SyncMutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
    notifications: broadcast::Sender<Notification>,
    alive: AtomicBool,
    exit: SyncMutex<Option<ExitState>>,
    stderr_tail: Arc<SyncMutex<VecDeque<String>>>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Fired once when the reader task observes the child has exited, so
    /// callers awaiting a notification can race process exit instead of
    /// blocking forever on a broadcast channel whose sender never drops.
    pub(crate) exit_notify: Arc<Notify>,
}

impl CodexTransport {
    /// Spawn the child process named by `binary` (default `codex`) with
    /// `extra_args`, wiring piped stdio, and start the background reader.
    pub fn spawn(
        binary: &str,
        extra_args: &[String],
        handler: Arc<dyn ServerRequestHandler>,
    ) -> CodexResult<Arc<Self>> {
        let mut cmd = tokio::process::Command::new(binary);
        cmd.args(extra_args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| CodexError::Spawn {
            binary: binary.to_string(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CodexError::Io(broken_pipe("stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CodexError::Io(broken_pipe("stdout")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CodexError::Io(broken_pipe("stderr")))?;

        let (notifications, _) = broadcast::channel(256);
        let stderr_tail = Arc::new(SyncMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let transport = Arc::new(Self {
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            next_id: AtomicU64::new(1),
            pending: SyncMutex::new(HashMap::new()),
            notifications,
            alive: AtomicBool::new(true),
            exit: SyncMutex::new(None),
            stderr_tail: stderr_tail.clone(),
            reader: Mutex::new(None),
            exit_notify: Arc::new(Notify::new()),
        });

        // Stderr tail collector: keeps only the last STDERR_TAIL_LINES lines.
        tokio::spawn({
            let stderr_tail = stderr_tail.clone();
            async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = stderr_tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        });

        let reader_handle = tokio::spawn({
            let transport = transport.clone();
            async move {
                transport.run_reader(stdout, handler).await;
            }
        });
        *transport.reader.try_lock().expect("fresh transport") = Some(reader_handle);

        Ok(transport)
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a request and await its matching response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> CodexResult<Value> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(self.exit_error());
        }
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)?;
        if let Err(e) = self.write_line(&json).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(resp) => resp.into_result().map_err(CodexError::from),
            Err(_) => Err(self.exit_error()),
        }
    }

    /// Send a request with an explicit timeout, racing process exit.
    pub async fn request_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> CodexResult<Value> {
        match tokio::time::timeout(timeout, self.request(method, params)).await {
            Ok(res) => res,
            Err(_) => Err(CodexError::Timeout(method.to_string())),
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> CodexResult<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(self.exit_error());
        }
        let notif = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notif)?;
        self.write_line(&json).await
    }

    /// Subscribe to the notification stream (for `item/agentMessage/delta`
    /// style consumption, or `wait_for_notification` below).
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Wait for a single notification matching `method` whose params satisfy
    /// `predicate`, or time out.
    pub async fn wait_for_notification<F>(
        &self,
        method: &str,
        predicate: F,
        timeout: Duration,
    ) -> CodexResult<Notification>
    where
        F: Fn(Option<&Value>) -> bool,
    {
        let mut rx = self.subscribe();
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(n) if n.method == method && predicate(n.params.as_ref()) => return Ok(n),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(self.exit_error());
                    }
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(res) => res,
            Err(_) => Err(CodexError::Timeout(format!("notification:{method}"))),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// External cancellation: close stdin, kill the child, fail everything
    /// pending.
    pub async fn cancel(&self) {
        self.alive.store(false, Ordering::SeqCst);
        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
        self.fail_all(CodexError::Cancelled.to_string());
        self.exit_notify.notify_waiters();
    }

    /// Graceful shutdown: close stdin, wait briefly, then kill.
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }
        let mut child = self.child.lock().await;
        let waited = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
        if waited.is_err() {
            let _ = child.kill().await;
        }
        self.fail_all("codex transport shut down".to_string());
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
    }

    fn fail_all(&self, diagnostic: String) {
        for (_, tx) in self.pending.lock().drain() {
            let _ = tx.send(JsonRpcResponse::err(0, -32000, diagnostic.clone()));
        }
    }

    pub(crate) fn exit_error(&self) -> CodexError {
        let diagnostic = self
            .exit
            .lock()
            .as_ref()
            .map(|e| e.diagnostic.clone())
            .unwrap_or_else(|| "codex process is not running".to_string());
        CodexError::Exited { diagnostic }
    }

    async fn write_line(&self, json: &str) -> CodexResult<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn run_reader(
        self: Arc<Self>,
        stdout: tokio::process::ChildStdout,
        handler: Arc<dyn ServerRequestHandler>,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        let mut non_json_tail: VecDeque<String> = VecDeque::with_capacity(MAX_NON_JSON_STDOUT_LINES);

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "codex stdout read error");
                    break;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let parsed: Result<InboundMessage, _> = serde_json::from_str(trimmed);
            match parsed {
                Ok(InboundMessage::Response(resp)) => {
                    if let Some(tx) = self.pending.lock().remove(&resp.id) {
                        let _ = tx.send(resp);
                    }
                }
                Ok(InboundMessage::Notification { method, params, .. }) => {
                    let _ = self.notifications.send(Notification { method, params });
                }
                Ok(InboundMessage::Request { id, method, params, .. }) => {
                    let transport = self.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        let outcome = handler.handle(&method, params).await;
                        let resp = match outcome {
                            Ok(value) => JsonRpcResponse::ok(id, value),
                            Err(e) => JsonRpcResponse::err(id, e.code, e.message),
                        };
                        if let Ok(json) = serde_json::to_string(&resp) {
                            let _ = transport.write_line(&json).await;
                        }
                    });
                }
                Err(_) => {
                    if non_json_tail.len() == MAX_NON_JSON_STDOUT_LINES {
                        non_json_tail.pop_front();
                    }
                    non_json_tail.push_back(trimmed.to_string());
                }
            }
        }

        // Child exited (or stdout closed). Wait for the actual exit status
        // so we can build the "wrong binary / too-old CLI" hint.
        self.alive.store(false, Ordering::SeqCst);
        let status = self.child.lock().await.try_wait();
        let mut diagnostic = String::new();
        if let Ok(Some(status)) = status {
            diagnostic.push_str(&format!("codex process exited with {status}"));
            if status.success() {
                diagnostic.push_str(
                    " (exit code 0 — check that GATEWAY is configured with the correct \
                     codex binary; a too-old CLI build often exits cleanly without \
                     speaking the expected protocol)",
                );
            }
        } else {
            diagnostic.push_str("codex process exited");
        }
        let stderr_tail: Vec<String> = self.stderr_tail.lock().iter().cloned().collect();
        if !stderr_tail.is_empty() {
            diagnostic.push_str(&format!("\nstderr (tail):\n{}", stderr_tail.join("\n")));
        }
        if !non_json_tail.is_empty() {
            diagnostic.push_str(&format!(
                "\nnon-JSON stdout lines:\n{}",
                non_json_tail.iter().cloned().collect::<Vec<_>>().join("\n")
            ));
        }

        *self.exit.lock() = Some(ExitState {
            diagnostic: diagnostic.clone(),
        });
        self.fail_all(diagnostic);
        self.exit_notify.notify_waiters();
    }
}

fn broken_pipe(stream: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("failed to capture child {stream}"),
    )
}
