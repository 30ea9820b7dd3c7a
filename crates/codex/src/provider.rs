//! Adapts a spawned [`CodexClient`] to the gateway's `LlmProvider` interface
//! (C6, §4.6) so the turn orchestrator can treat a `codex-oauth:<id>` route
//! exactly like any HTTP provider.
//!
//! Codex's turn protocol takes one prompt string, not a message array with
//! tool definitions — tool integration is declined at the transport layer
//! (`requestApproval` server-requests are auto-rejected, per §4.5). This
//! adapter flattens canonical history into a single transcript prompt and
//! always returns an empty `tool_calls` list.

use std::collections::HashMap;

use async_trait::async_trait;
use sa_domain::error::{Error, Result};
use sa_domain::message::Message;
use sa_domain::tool::{ToolCall, ToolDefinition};
use sa_providers::traits::{LlmProvider, OnDelta, SamplingOverrides, TurnResult};

use crate::transport::CodexError;
use crate::turn::{CodexClient, CodexTurnRequest};

pub struct CodexProvider {
    id: String,
    client: CodexClient,
    default_model: String,
    cwd: String,
}

impl CodexProvider {
    pub fn new(
        id: impl Into<String>,
        client: CodexClient,
        default_model: impl Into<String>,
        cwd: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            client,
            default_model: default_model.into(),
            cwd: cwd.into(),
        }
    }

    /// Tear down the underlying Codex child process cleanly.
    pub async fn shutdown(&self) {
        self.client.shutdown().await;
    }

    /// Abort the in-flight turn, if any, and tear down the child process.
    pub async fn cancel(&self) {
        self.client.cancel().await;
    }
}

#[async_trait]
impl LlmProvider for CodexProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn stream_turn(
        &self,
        _headers: HashMap<String, String>,
        messages: &[Message],
        _tools: &[ToolDefinition],
        sampling: &SamplingOverrides,
        on_delta: &mut OnDelta<'_>,
    ) -> Result<TurnResult> {
        let model = sampling
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let prompt = flatten_prompt(messages);

        let req = CodexTurnRequest {
            model,
            cwd: self.cwd.clone(),
            prompt,
        };

        let out = self
            .client
            .run_turn_streaming(req, |delta| on_delta(delta))
            .await
            .map_err(from_codex_error)?;

        Ok(TurnResult {
            assistant_text: out.text,
            tool_calls: Vec::new(),
            finish_reason: out.finish_reason,
        })
    }

    fn build_assistant_tool_call_message(&self, text: &str, _tool_calls: &[ToolCall]) -> Message {
        Message::assistant(text)
    }
}

/// Render the canonical history as a single plain-text transcript the
/// Codex CLI's one-shot prompt field can consume: `role: text` per line,
/// system first, in order.
fn flatten_prompt(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| match m {
            Message::System { content } => format!("system: {content}"),
            Message::User { .. } => format!("user: {}", m.text()),
            Message::Assistant { .. } => format!("assistant: {}", m.text()),
            Message::Tool { content, .. } => format!("tool result: {content}"),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn from_codex_error(e: CodexError) -> Error {
    match e {
        CodexError::Timeout(what) => Error::Timeout(what),
        other => Error::UpstreamStream(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_history_in_order() {
        let messages = vec![
            Message::system("be helpful"),
            Message::user("hi"),
            Message::assistant("hello"),
        ];
        let prompt = flatten_prompt(&messages);
        assert_eq!(prompt, "system: be helpful\n\nuser: hi\n\nassistant: hello");
    }
}
