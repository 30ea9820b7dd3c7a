//! Provider Interface (C6, §4.6): the one polymorphic capability wrapping
//! the OpenAI-compatible (C3), Anthropic (C4), and Codex (C5) adapters
//! behind a uniform turn interface.

use std::collections::HashMap;

use async_trait::async_trait;
use sa_domain::error::Result;
use sa_domain::message::Message;
use sa_domain::tool::{ToolCall, ToolDefinition, ToolResult};

/// Sampling knobs a caller may override for a single turn.
#[derive(Debug, Clone, Default)]
pub struct SamplingOverrides {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub json_mode: bool,
    pub model: Option<String>,
}

/// Outcome of one `stream_turn` call: the reconstructed assistant text,
/// any tool calls the model asked for, and the upstream's finish reason.
#[derive(Debug, Clone, Default)]
pub struct TurnResult {
    pub assistant_text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
}

pub use sa_contextpack::ContextResult;

/// Invoked with each newly-arrived text suffix. Never the full cumulative
/// buffer — the stream parser has already stripped any duplication a
/// cumulative-streaming upstream would otherwise reintroduce (§4.3).
pub type OnDelta<'a> = dyn FnMut(&str) + Send + 'a;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// A unique identifier for this provider instance, the `id` half of a
    /// `routeKey` (§6).
    fn provider_id(&self) -> &str;

    /// Truncate `history` to `token_budget` (§4.7). The algorithm is shared
    /// by every provider — only wire serialization varies by kind.
    fn build_context(&self, history: &[Message], token_budget: u64) -> ContextResult {
        sa_contextpack::build(history, token_budget)
    }

    /// Stream one turn upstream, forwarding each text suffix to `on_delta`
    /// as it arrives. `messages`/`tools` are canonical (C1); this method is
    /// responsible for translating them to the upstream's wire format.
    async fn stream_turn(
        &self,
        headers: HashMap<String, String>,
        messages: &[Message],
        tools: &[ToolDefinition],
        sampling: &SamplingOverrides,
        on_delta: &mut OnDelta<'_>,
    ) -> Result<TurnResult>;

    /// Build the canonical assistant message carrying `text` and
    /// `tool_calls`, appended to history/transcript for this round.
    fn build_assistant_tool_call_message(&self, text: &str, tool_calls: &[ToolCall]) -> Message {
        Message::assistant_with_tool_calls(text, tool_calls.to_vec())
    }

    /// Build the canonical tool-result message(s) for a completed round —
    /// one per result. Anthropic merges these into a single wire-format
    /// `user` message with multiple `tool_result` blocks only when it
    /// serializes history into its own request body; the shape stored in
    /// history/transcript is the same for every provider.
    fn build_tool_result_messages(&self, results: &[ToolResult]) -> Vec<Message> {
        results
            .iter()
            .map(|r| {
                let content = serde_json::to_string(&r.content).unwrap_or_else(|_| "null".into());
                Message::tool_result(r.call_id.clone(), content)
            })
            .collect()
    }
}
