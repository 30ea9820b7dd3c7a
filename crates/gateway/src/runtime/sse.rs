//! SSE Emitter (C12, §4.12): coalesces the turn orchestrator's fine-grained
//! `assistant_start`/`delta`/`assistant_end` noise into a single buffered
//! `assistant` record per round, so adapters persist/forward durable
//! records instead of every token.
//!
//! Buffering begins at `assistant_end` and flushes after 250 ms of
//! quiescence, or immediately on `tool_result`/`assistant_start`/`error`/
//! `done`/channel-close (`eof`). `tool_call`/`tool_result`/`final`/`error`/
//! `done`/`meta` pass through unchanged (after any pending flush ahead of
//! them, to keep the durable record order intact).

use std::time::Duration;

use futures_util::stream::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::turn::TurnEvent;

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(250);

/// Why a buffered `assistant` record was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    AssistantStart,
    ToolResult,
    Error,
    Done,
    Debounce,
    Eof,
}

/// One tool call collected into a buffered `assistant` record.
#[derive(Debug, Clone, Serialize)]
pub struct BufferedToolCall {
    #[serde(rename = "callId")]
    pub call_id: String,
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantRecord {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
    #[serde(rename = "toolCalls")]
    pub tool_calls: Vec<BufferedToolCall>,
    pub reason: FlushReason,
}

/// A durable record forwarded to the HTTP layer: either a coalesced
/// `assistant` round or one of the orchestrator's other events, untouched.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Record {
    Assistant(AssistantRecord),
    Raw(TurnEvent),
}

impl Record {
    /// The SSE `event:` name this record should carry.
    pub fn event_name(&self) -> &'static str {
        match self {
            Record::Assistant(_) => "assistant",
            Record::Raw(event) => event.event_name(),
        }
    }
}

/// Wrap a turn's raw event channel with the debounce state machine,
/// yielding the durable `Record` stream the SSE handler writes out.
pub fn debounce(mut rx: mpsc::Receiver<TurnEvent>) -> impl Stream<Item = Record> {
    async_stream::stream! {
        let mut pending_text = String::new();
        let mut pending_tool_calls: Vec<BufferedToolCall> = Vec::new();
        let mut buffering = false;

        loop {
            let next = if buffering {
                match tokio::time::timeout(DEBOUNCE_WINDOW, rx.recv()).await {
                    Ok(event) => event,
                    Err(_elapsed) => {
                        yield flush(&mut pending_text, &mut pending_tool_calls, FlushReason::Debounce);
                        buffering = false;
                        continue;
                    }
                }
            } else {
                rx.recv().await
            };

            let Some(event) = next else {
                if buffering {
                    yield flush(&mut pending_text, &mut pending_tool_calls, FlushReason::Eof);
                }
                break;
            };

            match event {
                TurnEvent::Delta { text } => {
                    pending_text.push_str(&text);
                }
                TurnEvent::AssistantStart {} => {
                    if buffering {
                        yield flush(&mut pending_text, &mut pending_tool_calls, FlushReason::AssistantStart);
                    }
                    buffering = false;
                }
                TurnEvent::AssistantEnd {} => {
                    buffering = true;
                }
                TurnEvent::ToolCall { ref call_id, ref name, ref args } => {
                    pending_tool_calls.push(BufferedToolCall {
                        call_id: call_id.clone(),
                        name: name.clone(),
                        args: serde_json::from_str(&args.raw).unwrap_or(Value::Null),
                    });
                    yield Record::Raw(event);
                }
                TurnEvent::ToolResult { .. } => {
                    if buffering {
                        yield flush(&mut pending_text, &mut pending_tool_calls, FlushReason::ToolResult);
                        buffering = false;
                    }
                    yield Record::Raw(event);
                }
                TurnEvent::Error { .. } => {
                    if buffering {
                        yield flush(&mut pending_text, &mut pending_tool_calls, FlushReason::Error);
                        buffering = false;
                    }
                    yield Record::Raw(event);
                }
                TurnEvent::Done {} => {
                    if buffering {
                        yield flush(&mut pending_text, &mut pending_tool_calls, FlushReason::Done);
                        buffering = false;
                    }
                    yield Record::Raw(event);
                }
                // `final` isn't itself a trigger in §4.12's reason list, but it is
                // always immediately followed by `done` in this orchestrator, so
                // flushing ahead of it under that reason keeps durable records in
                // the order they actually happened (assistant text before final).
                TurnEvent::Final { .. } => {
                    if buffering {
                        yield flush(&mut pending_text, &mut pending_tool_calls, FlushReason::Done);
                        buffering = false;
                    }
                    yield Record::Raw(event);
                }
                TurnEvent::Meta { .. } => {
                    yield Record::Raw(event);
                }
            }
        }
    }
}

fn flush(text: &mut String, tool_calls: &mut Vec<BufferedToolCall>, reason: FlushReason) -> Record {
    Record::Assistant(AssistantRecord {
        kind: "assistant",
        text: std::mem::take(text),
        tool_calls: std::mem::take(tool_calls),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    async fn run(events: Vec<TurnEvent>) -> Vec<Record> {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            tx.send(event).await.unwrap();
        }
        drop(tx);
        debounce(rx).collect().await
    }

    fn tool_call(id: &str) -> TurnEvent {
        TurnEvent::ToolCall {
            call_id: id.into(),
            name: "exec".into(),
            args: crate::runtime::turn::ToolCallEventArgs {
                raw: "{}".into(),
                approval: crate::runtime::turn::ApprovalEventArgs { required: false, id: None, reason: None },
                warning: None,
            },
        }
    }

    #[tokio::test]
    async fn coalesces_deltas_into_one_assistant_record_on_done() {
        let records = run(vec![
            TurnEvent::AssistantStart {},
            TurnEvent::Delta { text: "Hel".into() },
            TurnEvent::Delta { text: "lo".into() },
            TurnEvent::AssistantEnd {},
            TurnEvent::Final { text: "Hello".into() },
            TurnEvent::Done {},
        ])
        .await;

        assert_eq!(records.len(), 3);
        match &records[0] {
            Record::Assistant(a) => {
                assert_eq!(a.text, "Hello");
                assert_eq!(a.reason, FlushReason::Done);
                assert!(a.tool_calls.is_empty());
            }
            _ => panic!("expected coalesced assistant record first"),
        }
        assert_eq!(records[1].event_name(), "final");
        assert_eq!(records[2].event_name(), "done");
    }

    #[tokio::test]
    async fn tool_result_flushes_buffer_with_collected_tool_calls() {
        let records = run(vec![
            TurnEvent::AssistantStart {},
            TurnEvent::Delta { text: "calling tool".into() },
            TurnEvent::AssistantEnd {},
            tool_call("c1"),
            TurnEvent::ToolResult {
                call_id: "c1".into(),
                name: "exec".into(),
                ok: true,
                result: Value::Null,
            },
        ])
        .await;

        assert_eq!(records.len(), 3);
        match &records[0] {
            Record::Assistant(a) => {
                assert_eq!(a.text, "calling tool");
                assert_eq!(a.tool_calls.len(), 1);
                assert_eq!(a.tool_calls[0].call_id, "c1");
                assert_eq!(a.reason, FlushReason::ToolResult);
            }
            other => panic!("expected assistant record, got {other:?}"),
        }
        assert_eq!(records[1].event_name(), "tool_call");
        assert_eq!(records[2].event_name(), "tool_result");
    }

    #[tokio::test]
    async fn meta_passes_through_untouched() {
        let records = run(vec![TurnEvent::Meta {
            session_id: "s1".into(),
            model: "gpt".into(),
            used_tokens: 10,
            dropped: 0,
        }])
        .await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_name(), "meta");
    }

    #[tokio::test]
    async fn eof_flushes_an_open_buffer() {
        let records = run(vec![
            TurnEvent::AssistantStart {},
            TurnEvent::Delta { text: "partial".into() },
            TurnEvent::AssistantEnd {},
        ])
        .await;
        assert_eq!(records.len(), 1);
        match &records[0] {
            Record::Assistant(a) => {
                assert_eq!(a.text, "partial");
                assert_eq!(a.reason, FlushReason::Eof);
            }
            other => panic!("expected assistant record, got {other:?}"),
        }
    }
}
