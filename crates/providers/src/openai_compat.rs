//! OpenAI-Compat Stream Parser (C3, §4.3) and its `LlmProvider` adapter.
//!
//! Works against OpenAI, Ollama, vLLM, LM Studio, Together, and any other
//! endpoint speaking the OpenAI chat completions wire format.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use sa_domain::error::{Error, Result};
use sa_domain::message::{ContentPart, Message, MessageContent};
use sa_domain::tool::{ToolCall, ToolDefinition};

use crate::accumulator::{merge_text, ToolCallAccumulator};
use crate::sse::for_each_data_line;
use crate::traits::{LlmProvider, OnDelta, SamplingOverrides, TurnResult};
use crate::util::from_reqwest;

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;
        Ok(Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: default_model.into(),
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
        let wire_messages: Vec<Value> = messages.iter().map(msg_to_openai).collect();
        let mut body = serde_json::json!({
            "model": self.effective_model(sampling),
            "messages": wire_messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(tool_to_openai).collect());
        }
        if let Some(t) = sampling.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(m) = sampling.max_tokens {
            body["max_tokens"] = serde_json::json!(m);
        }
        if sampling.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        body
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
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
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(messages, tools, sampling);

        let mut req = self.client.post(&url).json(&body);
        for (k, v) in &headers {
            req = req.header(k, v);
        }

        let resp = req.send().await.map_err(from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::UpstreamHttp {
                status: status.as_u16(),
                message: text.chars().take(200).collect(),
            });
        }

        let mut text_buf = String::new();
        let mut accumulator = ToolCallAccumulator::new();
        let mut finish_reason: Option<String> = None;

        for_each_data_line(resp, |data| {
            if data.trim() == "[DONE]" {
                return Ok(true);
            }
            let frame: Value = serde_json::from_str(data)?;
            let choice = match frame.get("choices").and_then(|c| c.as_array()).and_then(|a| a.first()) {
                Some(c) => c,
                None => return Ok(false),
            };
            let delta = choice.get("delta").or_else(|| choice.get("message"));
            if let Some(delta) = delta {
                if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        let merged = merge_text(&text_buf, text);
                        let suffix = merged[text_buf.len()..].to_string();
                        text_buf = merged;
                        if !suffix.is_empty() {
                            on_delta(&suffix);
                        }
                    }
                }
                if let Some(arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                    for tc in arr {
                        let index = tc.get("index").and_then(|v| v.as_u64());
                        let id = tc.get("id").and_then(|v| v.as_str());
                        let (name, args) = tc
                            .get("function")
                            .map(|f| {
                                (
                                    f.get("name").and_then(|v| v.as_str()),
                                    f.get("arguments").and_then(|v| v.as_str()),
                                )
                            })
                            .unwrap_or((None, None));
                        accumulator.merge(index, id, name, args);
                    }
                } else if let Some(fc) = delta.get("function_call") {
                    // Legacy single-function fallback (§4.3): no index/id at all.
                    let name = fc.get("name").and_then(|v| v.as_str());
                    let args = fc.get("arguments").and_then(|v| v.as_str());
                    accumulator.merge(None, None, name, args);
                }
            }
            if let Some(fr) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                finish_reason = Some(fr.to_string());
            }
            Ok(false)
        })
        .await?;

        Ok(TurnResult {
            assistant_text: text_buf,
            tool_calls: accumulator.finish(),
            finish_reason,
        })
    }
}

fn msg_to_openai(msg: &Message) -> Value {
    match msg {
        Message::System { content } => serde_json::json!({"role": "system", "content": content}),
        Message::User { content } => {
            serde_json::json!({"role": "user", "content": content_to_openai(content)})
        }
        Message::Assistant {
            content,
            tool_calls,
        } => {
            let mut obj = serde_json::json!({"role": "assistant"});
            let text = content.extract_all_text();
            obj["content"] = if text.is_empty() {
                Value::Null
            } else {
                Value::String(text)
            };
            if !tool_calls.is_empty() {
                obj["tool_calls"] =
                    Value::Array(tool_calls.iter().map(tool_call_to_openai).collect());
            }
            obj
        }
        Message::Tool {
            tool_call_id,
            content,
        } => serde_json::json!({
            "role": "tool",
            "tool_call_id": tool_call_id,
            "content": content,
        }),
    }
}

fn content_to_openai(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(t) => Value::String(t.clone()),
        MessageContent::Parts(parts) => {
            let arr: Vec<Value> = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => {
                        Some(serde_json::json!({"type": "text", "text": text}))
                    }
                    ContentPart::Image { url, .. } => {
                        Some(serde_json::json!({"type": "image_url", "image_url": {"url": url}}))
                    }
                    ContentPart::Thinking { .. } => None,
                })
                .collect();
            Value::Array(arr)
        }
    }
}

fn tool_call_to_openai(tc: &ToolCall) -> Value {
    serde_json::json!({
        "id": tc.call_id,
        "type": "function",
        "function": {"name": tc.name, "arguments": tc.args_raw},
    })
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_message_translates() {
        let msg = Message::system("be nice");
        let wire = msg_to_openai(&msg);
        assert_eq!(wire["role"], "system");
        assert_eq!(wire["content"], "be nice");
    }

    #[test]
    fn assistant_with_tool_calls_translates() {
        let msg = Message::assistant_with_tool_calls(
            "",
            vec![ToolCall {
                call_id: "c1".into(),
                index: Some(0),
                name: "exec".into(),
                args_raw: "{}".into(),
            }],
        );
        let wire = msg_to_openai(&msg);
        assert_eq!(wire["content"], Value::Null);
        assert_eq!(wire["tool_calls"][0]["id"], "c1");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "exec");
    }

    #[test]
    fn tool_message_translates() {
        let msg = Message::tool_result("c1", "ok");
        let wire = msg_to_openai(&msg);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "c1");
        assert_eq!(wire["content"], "ok");
    }
}
