//! The turn protocol the orchestrator runs on top of the raw stdio
//! transport: `initialize` → `notifications/initialized` → `account/read` →
//! `thread/start` → `turn/start`, collecting `item/agentMessage/delta`
//! notifications until `turn/completed`, racing process exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;


use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::transport::{CodexError, CodexResult, CodexTransport, DeclineApprovals};

const TURN_TIMEOUT: Duration = Duration::from_secs(300);

/// A single Codex turn request.
pub struct CodexTurnRequest {
    pub model: String,
    pub cwd: String,
    pub prompt: String,
}

/// The concatenated result of one Codex turn.
#[derive(Debug, Clone)]
pub struct CodexTurnOutput {
    pub text: String,
    pub finish_reason: Option<String>,
}

/// A client-side handle to a spawned Codex app-server process, wrapping the
/// raw [`CodexTransport`] with the turn protocol described in the spec.
///
/// Cheaply `Clone`: every clone shares the same underlying transport and
/// initialization state, so a turn-scoped caller can hand one copy to the
/// provider adapter and keep another for shutdown.
#[derive(Clone)]
pub struct CodexClient {
    transport: Arc<CodexTransport>,
    initialized: Arc<AtomicBool>,
}

impl CodexClient {
    /// Spawn `binary` (default `codex`, resolved by the caller from config
    /// or the `CODEX_BIN` environment variable) with `extra_args`.
    pub fn spawn(binary: &str, extra_args: &[String]) -> CodexResult<Self> {
        let transport = CodexTransport::spawn(binary, extra_args, Arc::new(DeclineApprovals))?;
        Ok(Self {
            transport,
            initialized: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn transport(&self) -> &Arc<CodexTransport> {
        &self.transport
    }

    async fn ensure_initialized(&self) -> CodexResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.transport
            .request(
                "initialize",
                Some(serde_json::json!({
                    "clientInfo": {
                        "name": "gateway",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                })),
            )
            .await?;
        self.transport
            .notify("notifications/initialized", None)
            .await?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// `account/read`; fails with a user-facing "not authenticated" message
    /// if the account requires auth and none is present.
    async fn require_authenticated(&self) -> CodexResult<()> {
        let account = self.transport.request("account/read", None).await?;
        let authenticated = account
            .get("authenticated")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| account.get("account").is_some());
        if !authenticated {
            return Err(CodexError::Exited {
                diagnostic: "not authenticated: run `codex login` before starting the gateway"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Run a full turn: `thread/start` → `turn/start` → collect deltas until
    /// `turn/completed`, timing out after 300s and racing process exit.
    pub async fn run_turn(&self, req: CodexTurnRequest) -> CodexResult<CodexTurnOutput> {
        self.run_turn_streaming(req, |_| {}).await
    }

    /// Same as [`Self::run_turn`], but invokes `on_delta` with each
    /// `item/agentMessage/delta` text chunk as it arrives, rather than only
    /// returning the fully concatenated text at the end.
    pub async fn run_turn_streaming(
        &self,
        req: CodexTurnRequest,
        mut on_delta: impl FnMut(&str),
    ) -> CodexResult<CodexTurnOutput> {
        self.ensure_initialized().await?;
        self.require_authenticated().await?;

        let thread = self
            .transport
            .request(
                "thread/start",
                Some(serde_json::json!({
                    "model": req.model,
                    "cwd": req.cwd,
                    "approvalPolicy": "never",
                    "sandbox": "readOnly",
                })),
            )
            .await?;
        let thread_id = thread
            .get("threadId")
            .and_then(Value::as_str)
            .ok_or_else(|| CodexError::Exited {
                diagnostic: "thread/start returned no threadId".to_string(),
            })?
            .to_string();

        // Subscribe before sending turn/start so we never miss an early delta.
        let mut notifications = self.transport.subscribe();
        let exit_notify = self.transport.exit_notify.clone();

        self.transport
            .request(
                "turn/start",
                Some(serde_json::json!({
                    "threadId": thread_id,
                    "input": [{ "type": "text", "text": req.prompt }],
                })),
            )
            .await?;

        let collect = collect_until_completed_with(&mut notifications, &mut on_delta);
        let result = tokio::select! {
            res = tokio::time::timeout(TURN_TIMEOUT, collect) => {
                res.map_err(|_| CodexError::Timeout("turn/completed".to_string()))?
            }
            _ = exit_notify.notified() => {
                Err(self.transport.exit_error())
            }
        };
        result
    }

    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
    }

    pub async fn cancel(&self) {
        self.transport.cancel().await;
    }
}

#[cfg(test)]
async fn collect_until_completed(
    notifications: &mut broadcast::Receiver<crate::transport::Notification>,
) -> CodexResult<CodexTurnOutput> {
    collect_until_completed_with(notifications, &mut |_| {}).await
}

async fn collect_until_completed_with(
    notifications: &mut broadcast::Receiver<crate::transport::Notification>,
    on_delta: &mut impl FnMut(&str),
) -> CodexResult<CodexTurnOutput> {
    let mut text = String::new();
    loop {
        match notifications.recv().await {
            Ok(n) if n.method == "item/agentMessage/delta" => {
                if let Some(delta) = n.params.as_ref().and_then(|p| p.get("text")).and_then(Value::as_str) {
                    text.push_str(delta);
                    on_delta(delta);
                }
            }
            Ok(n) if n.method == "turn/completed" => {
                let finish_reason = n
                    .params
                    .as_ref()
                    .and_then(|p| p.get("reason"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                return Ok(CodexTurnOutput { text, finish_reason });
            }
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                return Err(CodexError::Exited {
                    diagnostic: "codex notification stream closed".to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Notification;
    use tokio::sync::broadcast;

    #[tokio::test]
    async fn collect_until_completed_concatenates_deltas() {
        let (tx, mut rx) = broadcast::channel(8);
        tx.send(Notification {
            method: "item/agentMessage/delta".into(),
            params: Some(serde_json::json!({"text": "He"})),
        })
        .unwrap();
        tx.send(Notification {
            method: "item/agentMessage/delta".into(),
            params: Some(serde_json::json!({"text": "llo"})),
        })
        .unwrap();
        tx.send(Notification {
            method: "turn/completed".into(),
            params: Some(serde_json::json!({"reason": "stop"})),
        })
        .unwrap();

        let out = collect_until_completed(&mut rx).await.unwrap();
        assert_eq!(out.text, "Hello");
        assert_eq!(out.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn collect_until_completed_ignores_unrelated_notifications() {
        let (tx, mut rx) = broadcast::channel(8);
        tx.send(Notification {
            method: "item/other".into(),
            params: None,
        })
        .unwrap();
        tx.send(Notification {
            method: "turn/completed".into(),
            params: None,
        })
        .unwrap();
        let out = collect_until_completed(&mut rx).await.unwrap();
        assert_eq!(out.text, "");
        assert_eq!(out.finish_reason, None);
    }
}
