//! Turn Orchestrator (C10, §4.10): the tool-loop fixpoint driving one
//! `/api/chat` request from the user's message to a `done` SSE event.
//!
//! Invoked under the caller's session lock (C11) so the whole turn —
//! transcript append, context build, provider round-trips, tool dispatch —
//! runs with exclusive access to the session's history. Events are pushed
//! into a bounded channel as they happen; only `delta` events are ever
//! dropped under backpressure, everything else blocks the producer until
//! the consumer (the SSE handler) catches up.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use sa_domain::error::Error;
use sa_domain::message::Message;
use sa_domain::tool::{ToolCall, ToolDefinition};
use sa_domain::trace::TraceEvent;
use sa_domain::transcript::TranscriptRecord;
use sa_providers::{SamplingOverrides, TurnResult};

use crate::runtime::approval::Decision;
use crate::runtime::provider::resolve_turn_provider;
use crate::runtime::tools::ToolAccessMode;
use crate::state::AppState;

/// Tool loop iteration cap (§4.10): a turn that hasn't reached a final
/// answer after this many rounds aborts with `too_many_turns`.
pub const MAX_TOOL_ITERATIONS: u32 = 24;

/// Capacity of the SSE event channel the HTTP handler creates before
/// calling `run_turn`. Only `Delta` coalesces under backpressure; every
/// other event blocks the producer instead of dropping.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How the client wants the stream shaped (§6): `full` emits every event,
/// `final` emits only `meta`/`final`/`error`/`done` (the HTTP layer filters).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    #[default]
    Full,
    Final,
}

/// One `/api/chat` request, already validated (session id shape, non-empty
/// text) by the HTTP handler.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub session_id: String,
    pub user_text: String,
    pub route_key: Option<String>,
    pub tool_access_mode: ToolAccessMode,
    pub stream_mode: StreamMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalEventArgs {
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallEventArgs {
    pub raw: String,
    pub approval: ApprovalEventArgs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// The exact SSE event taxonomy (§6), one variant per `event:` name.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TurnEvent {
    #[serde(rename = "meta")]
    Meta {
        #[serde(rename = "sessionId")]
        session_id: String,
        model: String,
        #[serde(rename = "usedTokens")]
        used_tokens: u64,
        dropped: usize,
    },
    #[serde(rename = "assistant_start")]
    AssistantStart {},
    #[serde(rename = "delta")]
    Delta { text: String },
    #[serde(rename = "assistant_end")]
    AssistantEnd {},
    #[serde(rename = "tool_call")]
    ToolCall {
        #[serde(rename = "callId")]
        call_id: String,
        name: String,
        args: ToolCallEventArgs,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(rename = "callId")]
        call_id: String,
        name: String,
        ok: bool,
        result: Value,
    },
    #[serde(rename = "final")]
    Final { text: String },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "done")]
    Done {},
}

impl TurnEvent {
    /// The `event:` name an SSE frame should carry for this variant.
    pub fn event_name(&self) -> &'static str {
        match self {
            TurnEvent::Meta { .. } => "meta",
            TurnEvent::AssistantStart {} => "assistant_start",
            TurnEvent::Delta { .. } => "delta",
            TurnEvent::AssistantEnd {} => "assistant_end",
            TurnEvent::ToolCall { .. } => "tool_call",
            TurnEvent::ToolResult { .. } => "tool_result",
            TurnEvent::Final { .. } => "final",
            TurnEvent::Error { .. } => "error",
            TurnEvent::Done {} => "done",
        }
    }

    /// Whether `stream_mode: final` still forwards this event.
    fn survives_final_mode(&self) -> bool {
        matches!(
            self,
            TurnEvent::Meta { .. } | TurnEvent::Final { .. } | TurnEvent::Error { .. } | TurnEvent::Done {}
        )
    }
}

/// Run one full turn, pushing events into `tx` as they occur. Always
/// terminates by sending `Done` (after `Final` or `Error`), then returns.
///
/// Must be called with the session lock already held (see `api::chat`).
/// `Delta` events are sent with `try_send` and silently dropped if the
/// channel is full; every other event blocks the producer until the
/// consumer (the SSE handler) catches up.
pub async fn run_turn(state: &AppState, input: TurnInput, tx: mpsc::Sender<TurnEvent>) {
    let cancel_token = state.cancel_map.register(&input.session_id);

    macro_rules! emit {
        ($ev:expr) => {{
            let ev = $ev;
            if input.stream_mode != StreamMode::Final || ev.survives_final_mode() {
                let _ = tx.send(ev).await;
            }
        }};
    }
    macro_rules! emit_delta {
        ($text:expr) => {{
            if input.stream_mode != StreamMode::Final {
                let _ = tx.try_send(TurnEvent::Delta { text: $text });
            }
        }};
    }

    let provider = match resolve_turn_provider(&state.config, &state.providers, input.route_key.as_deref()).await {
        Ok(p) => p,
        Err(e) => {
            emit!(TurnEvent::Error { message: e.to_string() });
            emit!(TurnEvent::Done {});
            state.cancel_map.remove(&input.session_id);
            return;
        }
    };

    let now = chrono::Utc::now();
    let user_record = TranscriptRecord::Msg {
        id: uuid::Uuid::new_v4().to_string(),
        ts: now.timestamp_millis(),
        v: 1,
        msg: Message::user(input.user_text.clone()),
    };
    if let Err(e) = state.transcripts.append(&input.session_id, &user_record) {
        emit!(TurnEvent::Error { message: e.to_string() });
        emit!(TurnEvent::Done {});
        provider.shutdown().await;
        state.cancel_map.remove(&input.session_id);
        return;
    }
    state.sessions.touch(&input.session_id);

    let token_budget = state.config.context.default_token_budget;
    let route_key_label = input.route_key.clone().unwrap_or_else(|| provider.provider().provider_id().to_string());

    let mut history = match state.transcripts.effective_messages(&input.session_id) {
        Ok(h) => h,
        Err(e) => {
            emit!(TurnEvent::Error { message: e.to_string() });
            emit!(TurnEvent::Done {});
            provider.shutdown().await;
            state.cancel_map.remove(&input.session_id);
            return;
        }
    };
    let llm = provider.provider();
    let mut context = llm.build_context(&history, token_budget);

    TraceEvent::ContextBuilt {
        session_id: input.session_id.clone(),
        used_tokens: context.used_tokens,
        dropped: context.dropped,
    }
    .emit();

    let turn_record = TranscriptRecord::Turn {
        id: uuid::Uuid::new_v4().to_string(),
        ts: chrono::Utc::now().timestamp_millis(),
        v: 1,
        token_budget,
        used_tokens: context.used_tokens,
        resolved_upstream: route_key_label.clone(),
        sampling_overrides: Value::Null,
    };
    let _ = state.transcripts.append(&input.session_id, &turn_record);

    emit!(TurnEvent::Meta {
        session_id: input.session_id.clone(),
        model: llm.provider_id().to_string(),
        used_tokens: context.used_tokens,
        dropped: context.dropped,
    });

    let tool_defs: Vec<ToolDefinition> = state.tools.tool_definitions();
    let mut text_fallback_counter: u32 = 0;

    let mut iteration: u32 = 0;
    loop {
        if cancel_token.is_cancelled() {
            emit!(TurnEvent::Error { message: "turn cancelled".into() });
            emit!(TurnEvent::Done {});
            break;
        }

        iteration += 1;
        if iteration > MAX_TOOL_ITERATIONS {
            let err = Error::TooManyTurns(MAX_TOOL_ITERATIONS);
            emit!(TurnEvent::Error { message: err.to_string() });
            emit!(TurnEvent::Done {});
            break;
        }

        TraceEvent::TurnStarted {
            session_id: input.session_id.clone(),
            route_key: route_key_label.clone(),
            iteration,
        }
        .emit();

        let headers = match provider.credential().headers() {
            Ok(h) => h,
            Err(e) => {
                emit!(TurnEvent::Error { message: e.to_string() });
                emit!(TurnEvent::Done {});
                break;
            }
        };

        emit!(TurnEvent::AssistantStart {});

        let iter_started = std::time::Instant::now();
        let sampling = SamplingOverrides::default();
        let mut assistant_text = String::new();
        let result: Result<TurnResult, sa_domain::error::Error> = {
            let mut on_delta = |delta: &str| {
                assistant_text.push_str(delta);
                emit_delta!(delta.to_string());
            };
            llm.stream_turn(headers, &context.messages, &tool_defs, &sampling, &mut on_delta)
                .await
        };

        emit!(TurnEvent::AssistantEnd {});

        let turn_result = match result {
            Ok(r) => r,
            Err(e) => {
                emit!(TurnEvent::Error { message: e.to_string() });
                emit!(TurnEvent::Done {});
                break;
            }
        };

        TraceEvent::TurnFinished {
            session_id: input.session_id.clone(),
            iteration,
            finish_reason: turn_result.finish_reason.clone(),
            duration_ms: iter_started.elapsed().as_millis() as u64,
        }
        .emit();

        let text = if turn_result.assistant_text.is_empty() {
            assistant_text
        } else {
            turn_result.assistant_text.clone()
        };

        let mut tool_calls = turn_result.tool_calls.clone();
        let mut fallback_warning = None;
        if tool_calls.is_empty() {
            let (parsed, warning) =
                parse_plaintext_tool_calls(&text, &mut text_fallback_counter, |name| {
                    state.tools.is_known_tool(name)
                });
            tool_calls = parsed;
            fallback_warning = warning;
        }

        if tool_calls.is_empty() {
            let assistant_record = TranscriptRecord::Msg {
                id: uuid::Uuid::new_v4().to_string(),
                ts: chrono::Utc::now().timestamp_millis(),
                v: 1,
                msg: Message::assistant(text.clone()),
            };
            let _ = state.transcripts.append(&input.session_id, &assistant_record);
            emit!(TurnEvent::Final { text });
            emit!(TurnEvent::Done {});
            break;
        }

        let assistant_record = TranscriptRecord::Msg {
            id: uuid::Uuid::new_v4().to_string(),
            ts: chrono::Utc::now().timestamp_millis(),
            v: 1,
            msg: llm.build_assistant_tool_call_message(&text, &tool_calls),
        };
        let _ = state.transcripts.append(&input.session_id, &assistant_record);

        for call in &tool_calls {
            if cancel_token.is_cancelled() {
                break;
            }

            let parsed_args: Value =
                serde_json::from_str(&call.args_raw).unwrap_or_else(|_| Value::Object(Default::default()));
            let safety = state.tools.check_safety(&call.name, &parsed_args, input.tool_access_mode);

            // every synthetic call from this round carries the same fallback warning,
            // not just the first (plaintext fallback is all-or-nothing per round)
            let warning = fallback_warning.clone();

            let (result_value, ok) = if safety.require_approval {
                let (approval_id, waiter) = state.approvals.create(
                    input.session_id.clone(),
                    safety.reason.clone().unwrap_or_default(),
                    None,
                );
                TraceEvent::ApprovalCreated {
                    approval_id: approval_id.to_string(),
                    session_id: input.session_id.clone(),
                    tool_name: call.name.clone(),
                }
                .emit();

                emit!(TurnEvent::ToolCall {
                    call_id: call.call_id.clone(),
                    name: call.name.clone(),
                    args: ToolCallEventArgs {
                        raw: call.args_raw.clone(),
                        approval: ApprovalEventArgs {
                            required: true,
                            id: Some(approval_id.to_string()),
                            reason: safety.reason.clone(),
                        },
                        warning,
                    },
                });

                let outcome = waiter.await;
                let (decision, timed_out) = match outcome {
                    Ok(o) => (o.decision, o.timed_out),
                    Err(_) => (Decision::Deny, true),
                };
                TraceEvent::ApprovalDecided {
                    approval_id: approval_id.to_string(),
                    session_id: input.session_id.clone(),
                    decision: format!("{decision:?}").to_lowercase(),
                    timed_out,
                }
                .emit();

                if decision == Decision::Deny {
                    let code = if timed_out { "approval_timeout" } else { "denied_by_user" };
                    (
                        serde_json::json!({ "ok": false, "error": { "code": code, "message": "tool call was not approved" } }),
                        false,
                    )
                } else {
                    state
                        .tools
                        .dispatch(&input.session_id, &call.call_id, &call.name, parsed_args)
                        .await
                }
            } else {
                emit!(TurnEvent::ToolCall {
                    call_id: call.call_id.clone(),
                    name: call.name.clone(),
                    args: ToolCallEventArgs {
                        raw: call.args_raw.clone(),
                        approval: ApprovalEventArgs {
                            required: false,
                            id: None,
                            reason: safety.reason.clone(),
                        },
                        warning,
                    },
                });
                state
                    .tools
                    .dispatch(&input.session_id, &call.call_id, &call.name, parsed_args)
                    .await
            };

            let tool_record = TranscriptRecord::Msg {
                id: uuid::Uuid::new_v4().to_string(),
                ts: chrono::Utc::now().timestamp_millis(),
                v: 1,
                msg: Message::tool_result(call.call_id.clone(), result_value.to_string()),
            };
            let _ = state.transcripts.append(&input.session_id, &tool_record);

            emit!(TurnEvent::ToolResult {
                call_id: call.call_id.clone(),
                name: call.name.clone(),
                ok,
                result: result_value,
            });
        }

        history = match state.transcripts.effective_messages(&input.session_id) {
            Ok(h) => h,
            Err(e) => {
                emit!(TurnEvent::Error { message: e.to_string() });
                emit!(TurnEvent::Done {});
                break;
            }
        };
        context = llm.build_context(&history, token_budget);
        TraceEvent::ContextBuilt {
            session_id: input.session_id.clone(),
            used_tokens: context.used_tokens,
            dropped: context.dropped,
        }
        .emit();
    }

    provider.shutdown().await;
    state.cancel_map.remove(&input.session_id);
}

fn paren_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Tool\s+([\w.-]+)\s*\(\s*(?:calling|call)\s*\)\s*:\s*(\{.*\})\s*$").unwrap()
    })
}

fn bracket_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[tool:([\w.-]+)\]\s*(\{.*\})\s*(?:</tool:([\w.-]+)>)?\s*$").unwrap()
    })
}

/// Parse the plaintext tool-call fallback forms (§4.10): a model that
/// wasn't asked to (or can't) use structured tool calling sometimes says
/// what it wants to do in plain text instead. Recognizes at most one call
/// per line, paren form before bracket form, and only for names the
/// dispatcher actually knows about. Synthesized call ids are
/// `call_text_<rand12>_<i>` so they never collide with a real provider id.
fn parse_plaintext_tool_calls(
    text: &str,
    counter: &mut u32,
    is_known: impl Fn(&str) -> bool,
) -> (Vec<ToolCall>, Option<String>) {
    let mut calls = Vec::new();
    let mut saw_fallback = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parsed = if let Some(caps) = paren_regex().captures(line) {
            Some((caps[1].to_string(), caps[2].to_string()))
        } else if let Some(caps) = bracket_regex().captures(line) {
            let name = caps[1].to_string();
            if let Some(closing) = caps.get(3) {
                if closing.as_str() != name {
                    continue;
                }
            }
            Some((name, caps[2].to_string()))
        } else {
            None
        };

        let Some((name, json_str)) = parsed else { continue };
        if !is_known(&name) {
            continue;
        }
        if serde_json::from_str::<Value>(&json_str).map(|v| v.is_object()).unwrap_or(false) {
            let rand = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
            let call_id = format!("call_text_{rand}_{}", *counter);
            *counter += 1;
            calls.push(ToolCall {
                call_id,
                index: None,
                name,
                args_raw: json_str,
            });
            saw_fallback = true;
        }
    }

    let warning = saw_fallback.then(|| "parsed from plaintext tool-call fallback syntax, not structured tool calling".to_string());
    (calls, warning)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(name: &str) -> bool {
        name == "exec"
    }

    #[test]
    fn parses_paren_form() {
        let mut counter = 0;
        let (calls, warning) = parse_plaintext_tool_calls(
            "Tool exec(calling): {\"command\": \"ls\"}",
            &mut counter,
            known,
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "exec");
        assert!(calls[0].call_id.starts_with("call_text_"));
        assert!(warning.is_some());
    }

    #[test]
    fn parses_bracket_form_with_matching_closing_tag() {
        let mut counter = 0;
        let (calls, _) = parse_plaintext_tool_calls(
            "[tool:exec] {\"command\": \"ls\"}</tool:exec>",
            &mut counter,
            known,
        );
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn rejects_mismatched_closing_tag() {
        let mut counter = 0;
        let (calls, _) = parse_plaintext_tool_calls(
            "[tool:exec] {\"command\": \"ls\"}</tool:other>",
            &mut counter,
            known,
        );
        assert!(calls.is_empty());
    }

    #[test]
    fn ignores_unknown_tool_names() {
        let mut counter = 0;
        let (calls, warning) = parse_plaintext_tool_calls(
            "Tool mystery(call): {}",
            &mut counter,
            known,
        );
        assert!(calls.is_empty());
        assert!(warning.is_none());
    }

    #[test]
    fn paren_form_wins_over_bracket_on_separate_lines() {
        let mut counter = 0;
        let text = "Tool exec(calling): {\"command\": \"a\"}\n[tool:exec] {\"command\": \"b\"}";
        let (calls, _) = parse_plaintext_tool_calls(text, &mut counter, known);
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0].call_id, calls[1].call_id);
    }

    #[test]
    fn plain_prose_yields_no_calls() {
        let mut counter = 0;
        let (calls, warning) = parse_plaintext_tool_calls("just a normal reply", &mut counter, known);
        assert!(calls.is_empty());
        assert!(warning.is_none());
    }
}
