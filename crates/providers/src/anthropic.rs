//! Anthropic Adapter (C4, §4.4): the Anthropic Messages API `LlmProvider`
//! implementation — typed SSE event parsing, tool-use reconstruction, and
//! the system-message-hoisted wire format.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use sa_domain::error::{Error, Result};
use sa_domain::message::{ContentPart, Message, MessageContent};
use sa_domain::tool::{ToolCall, ToolDefinition};

use crate::accumulator::merge_text;
use crate::sse::for_each_data_line;
use crate::traits::{LlmProvider, OnDelta, SamplingOverrides, TurnResult};
use crate::util::from_reqwest;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    id: String,
    base_url: String,
    default_model: String,
    top_k: Option<u32>,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        default_model: impl Into<String>,
        top_k: Option<u32>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: default_model.into(),
            top_k,
            client,
        })
    }

    fn effective_model(&self, sampling: &SamplingOverrides) -> String {
        sampling
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone())
    }

    fn build_body(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        sampling: &SamplingOverrides,
    ) -> Value {
        let (system, wire_messages) = translate_messages(messages);
        let mut body = serde_json::json!({
            "model": self.effective_model(sampling),
            "messages": wire_messages,
            "max_tokens": sampling.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": true,
        });
        if let Some(system) = system {
            body["system"] = Value::String(system);
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(tool_to_anthropic).collect());
        }
        if let Some(t) = sampling.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(k) = self.top_k {
            body["top_k"] = serde_json::json!(k);
        }
        body
    }

    fn request(&self, body: &Value, headers: &HashMap<String, String>) -> reqwest::RequestBuilder {
        let url = format!("{}/v1/messages", self.base_url);
        let mut req = self
            .client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body);
        for (k, v) in headers {
            req = req.header(k, v);
        }
        req
    }

    /// Send the request, retrying exactly once without `top_k` if the
    /// upstream rejects it with a 400 mentioning the field (§4.4: some
    /// Anthropic-compatible endpoints don't support `top_k`).
    async fn send_with_retry(
        &self,
        body: &mut Value,
        headers: &HashMap<String, String>,
    ) -> Result<reqwest::Response> {
        let resp = self.request(body, headers).send().await.map_err(from_reqwest)?;
        if resp.status().as_u16() == 400 && body.get("top_k").is_some() {
            let text = resp.text().await.unwrap_or_default();
            if text.contains("top_k") {
                body.as_object_mut().unwrap().remove("top_k");
                let retry = self.request(body, headers).send().await.map_err(from_reqwest)?;
                return Ok(retry);
            }
            return Err(Error::UpstreamHttp {
                status: 400,
                message: text.chars().take(200).collect(),
            });
        }
        Ok(resp)
    }
}

/// Per-content-block streaming state, keyed by the block's SSE `index`.
#[derive(Default)]
struct ToolBlockState {
    id: String,
    name: String,
    start_args: String,
    delta_args: String,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn stream_turn(
        &self,
        headers: HashMap<String, String>,
        messages: &[Message],
        tools: &[ToolDefinition],
        sampling: &SamplingOverrides,
        on_delta: &mut OnDelta<'_>,
    ) -> Result<TurnResult> {
        let mut body = self.build_body(messages, tools, sampling);
        let resp = self.send_with_retry(&mut body, &headers).await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::UpstreamHttp {
                status: status.as_u16(),
                message: text.chars().take(200).collect(),
            });
        }

        let mut text_buf = String::new();
        let mut tool_blocks: HashMap<u64, ToolBlockState> = HashMap::new();
        let mut finish_reason: Option<String> = None;
        let mut stream_error: Option<Error> = None;

        for_each_data_line(resp, |data| {
            let frame: Value = serde_json::from_str(data)?;
            let event_type = frame.get("type").and_then(|v| v.as_str()).unwrap_or("");

            match event_type {
                "content_block_start" => {
                    let index = frame.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                    if let Some(cb) = frame.get("content_block") {
                        if cb.get("type").and_then(|v| v.as_str()) == Some("tool_use") {
                            let id = cb.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                            let name = cb.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                            let start_args = match cb.get("input") {
                                Some(v) if v.is_object() && !v.as_object().unwrap().is_empty() => {
                                    v.to_string()
                                }
                                _ => String::new(),
                            };
                            tool_blocks.insert(
                                index,
                                ToolBlockState {
                                    id,
                                    name,
                                    start_args,
                                    delta_args: String::new(),
                                },
                            );
                        }
                    }
                }
                "content_block_delta" => {
                    let index = frame.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                    if let Some(delta) = frame.get("delta") {
                        match delta.get("type").and_then(|v| v.as_str()) {
                            Some("text_delta") => {
                                if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                                    if !text.is_empty() {
                                        let merged = merge_text(&text_buf, text);
                                        let suffix = merged[text_buf.len()..].to_string();
                                        text_buf = merged;
                                        if !suffix.is_empty() {
                                            on_delta(&suffix);
                                        }
                                    }
                                }
                            }
                            Some("input_json_delta") => {
                                if let Some(partial) =
                                    delta.get("partial_json").and_then(|v| v.as_str())
                                {
                                    tool_blocks
                                        .entry(index)
                                        .or_default()
                                        .delta_args
                                        .push_str(partial);
                                }
                            }
                            _ => {}
                        }
                    }
                }
                "message_delta" => {
                    if let Some(stop_reason) = frame
                        .get("delta")
                        .and_then(|d| d.get("stop_reason"))
                        .and_then(|v| v.as_str())
                    {
                        finish_reason = Some(map_finish_reason(stop_reason));
                    }
                }
                "message_stop" => return Ok(true),
                "error" => {
                    let msg = frame
                        .get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown upstream error");
                    stream_error = Some(Error::UpstreamStream(msg.chars().take(200).collect()));
                    return Ok(true);
                }
                _ => {}
            }
            Ok(false)
        })
        .await?;

        if let Some(err) = stream_error {
            return Err(err);
        }

        let mut indices: Vec<u64> = tool_blocks.keys().copied().collect();
        indices.sort_unstable();
        let tool_calls = indices
            .into_iter()
            .map(|idx| {
                let state = tool_blocks.remove(&idx).unwrap();
                // Never concatenate start/delta args — the delta stream, when
                // present, is the complete reconstruction on its own.
                let args_raw = if !state.delta_args.is_empty() {
                    state.delta_args
                } else if !state.start_args.is_empty() {
                    state.start_args
                } else {
                    "{}".to_string()
                };
                ToolCall {
                    call_id: state.id,
                    index: Some(idx),
                    name: state.name,
                    args_raw,
                }
            })
            .collect();

        Ok(TurnResult {
            assistant_text: text_buf,
            tool_calls,
            finish_reason,
        })
    }
}

fn map_finish_reason(stop_reason: &str) -> String {
    match stop_reason {
        "tool_use" => "tool_calls".to_string(),
        other => other.to_string(),
    }
}

/// Translate canonical history into an Anthropic wire request: the lone
/// system message (if any) hoisted into a top-level field, and every
/// assistant-with-tool-calls round paired with its tool-result messages
/// merged into one `tool_use`/`tool_result` exchange. An assistant tool-call
/// message whose matching tool messages were truncated out of history is
/// emitted with its tool_use blocks dropped — a partial round can't be
/// replayed to the API.
fn translate_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let system = messages.iter().find_map(|m| match m {
        Message::System { content } => Some(content.clone()),
        _ => None,
    });

    let rest: Vec<&Message> = messages
        .iter()
        .filter(|m| !matches!(m, Message::System { .. }))
        .collect();

    let mut out = Vec::new();
    let mut i = 0;
    while i < rest.len() {
        match rest[i] {
            Message::Assistant { content, tool_calls } if !tool_calls.is_empty() => {
                let ids: std::collections::HashSet<&str> =
                    tool_calls.iter().map(|tc| tc.call_id.as_str()).collect();
                let mut j = i + 1;
                let mut tool_msgs: Vec<(&String, &String)> = Vec::new();
                while j < rest.len() {
                    if let Message::Tool { tool_call_id, content } = rest[j] {
                        if ids.contains(tool_call_id.as_str()) {
                            tool_msgs.push((tool_call_id, content));
                            j += 1;
                            continue;
                        }
                    }
                    break;
                }

                let mut blocks = Vec::new();
                let text = content.extract_all_text();
                if !text.is_empty() {
                    blocks.push(serde_json::json!({"type": "text", "text": text}));
                }
                if !tool_msgs.is_empty() {
                    for tc in tool_calls {
                        blocks.push(serde_json::json!({
                            "type": "tool_use",
                            "id": tc.call_id,
                            "name": tc.name,
                            "input": parse_args(&tc.args_raw),
                        }));
                    }
                }
                out.push(serde_json::json!({"role": "assistant", "content": blocks}));

                if !tool_msgs.is_empty() {
                    let result_blocks: Vec<Value> = tool_msgs
                        .iter()
                        .map(|(id, content)| {
                            serde_json::json!({
                                "type": "tool_result",
                                "tool_use_id": id,
                                "content": content,
                            })
                        })
                        .collect();
                    out.push(serde_json::json!({"role": "user", "content": result_blocks}));
                }
                i = j;
            }
            Message::Assistant { content, .. } => {
                out.push(serde_json::json!({
                    "role": "assistant",
                    "content": content.extract_all_text(),
                }));
                i += 1;
            }
            Message::User { content } => {
                out.push(serde_json::json!({"role": "user", "content": content_to_anthropic(content)}));
                i += 1;
            }
            Message::Tool { tool_call_id, content } => {
                // An orphan tool message with no preceding assistant round in
                // this slice (its assistant message was truncated away).
                out.push(serde_json::json!({
                    "role": "user",
                    "content": [{"type": "tool_result", "tool_use_id": tool_call_id, "content": content}],
                }));
                i += 1;
            }
            Message::System { .. } => unreachable!("system messages filtered above"),
        }
    }

    (system, out)
}

fn content_to_anthropic(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(t) => Value::String(t.clone()),
        MessageContent::Parts(parts) => {
            let arr: Vec<Value> = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => {
                        Some(serde_json::json!({"type": "text", "text": text}))
                    }
                    ContentPart::Image { url, media_type } => Some(serde_json::json!({
                        "type": "image",
                        "source": {"type": "url", "url": url, "media_type": media_type},
                    })),
                    ContentPart::Thinking { .. } => None,
                })
                .collect();
            Value::Array(arr)
        }
    }
}

fn tool_to_anthropic(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

/// Parse a tool call's raw argument text into the JSON object Anthropic
/// expects as `input`. Anthropic's `input_json_delta` stream is occasionally
/// malformed when a proxy double-prefixes the initial snapshot; repair the
/// common `"{}{...}"` shape before giving up and wrapping the raw text.
fn parse_args(raw: &str) -> Value {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        if v.is_object() {
            return v;
        }
    }
    if let Some(rest) = raw.strip_prefix("{}") {
        if let Ok(v) = serde_json::from_str::<Value>(rest) {
            if v.is_object() {
                return v;
            }
        }
    }
    serde_json::json!({"__raw": raw})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hoists_system_message() {
        let messages = vec![Message::system("be nice"), Message::user("hi")];
        let (system, wire) = translate_messages(&messages);
        assert_eq!(system.as_deref(), Some("be nice"));
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["role"], "user");
    }

    #[test]
    fn merges_tool_round_into_tool_use_and_result_blocks() {
        let messages = vec![
            Message::user("run it"),
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCall {
                    call_id: "c1".into(),
                    index: Some(0),
                    name: "exec".into(),
                    args_raw: "{\"cmd\":\"ls\"}".into(),
                }],
            ),
            Message::tool_result("c1", "ok"),
        ];
        let (_, wire) = translate_messages(&messages);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[1]["role"], "assistant");
        assert_eq!(wire[1]["content"][0]["type"], "tool_use");
        assert_eq!(wire[1]["content"][0]["input"]["cmd"], "ls");
        assert_eq!(wire[2]["role"], "user");
        assert_eq!(wire[2]["content"][0]["type"], "tool_result");
        assert_eq!(wire[2]["content"][0]["tool_use_id"], "c1");
    }

    #[test]
    fn drops_orphan_tool_use_when_results_were_truncated() {
        let messages = vec![Message::assistant_with_tool_calls(
            "thinking",
            vec![ToolCall {
                call_id: "c1".into(),
                index: Some(0),
                name: "exec".into(),
                args_raw: "{}".into(),
            }],
        )];
        let (_, wire) = translate_messages(&messages);
        assert_eq!(wire.len(), 1);
        let content = wire[0]["content"].as_array().unwrap();
        assert!(content.iter().all(|b| b["type"] != "tool_use"));
    }

    #[test]
    fn effective_args_prefers_delta_over_start_never_concatenates() {
        let mut state = ToolBlockState {
            id: "c1".into(),
            name: "exec".into(),
            start_args: "{\"a\":1}".into(),
            delta_args: "{\"b\":2}".into(),
        };
        let args = if !state.delta_args.is_empty() {
            std::mem::take(&mut state.delta_args)
        } else {
            std::mem::take(&mut state.start_args)
        };
        assert_eq!(args, "{\"b\":2}");
    }

    #[test]
    fn parse_args_repairs_double_prefixed_snapshot() {
        let v = parse_args("{}{\"x\":1}");
        assert_eq!(v["x"], 1);
    }

    #[test]
    fn parse_args_wraps_unparseable_raw() {
        let v = parse_args("not json");
        assert_eq!(v["__raw"], "not json");
    }

    #[test]
    fn finish_reason_maps_tool_use_to_tool_calls() {
        assert_eq!(map_finish_reason("tool_use"), "tool_calls");
        assert_eq!(map_finish_reason("end_turn"), "end_turn");
    }
}
