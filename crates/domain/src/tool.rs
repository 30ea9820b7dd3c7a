use serde::{Deserialize, Serialize};

/// A tool call captured verbatim from an upstream provider.
///
/// `args_raw` is the JSON-object text exactly as it arrived upstream (after
/// cumulative/delta reconstruction); it is never re-parsed into a generic
/// value at this layer. `index` is the provider-assigned streaming slot used
/// to key the accumulator (see `sa_providers::accumulator`), carried through
/// so the same tie-break rule used during streaming can be replayed.
///
/// Invariant: within one assistant message, `call_id` is unique; across a
/// transcript, `call_id` links `assistant.tool_calls[i]` to exactly one
/// `tool` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    pub name: String,
    pub args_raw: String,
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// The result of dispatching one tool call: `(callId, content, ok)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub content: serde_json::Value,
    pub ok: bool,
}
