//! End-to-end coverage of `/api/chat`, driving the full HTTP surface
//! against a scripted upstream instead of a real OpenAI/Anthropic endpoint.
//! Each test spins up a real `axum::serve` listener and a real
//! `reqwest::Client`, so the whole stack — routing, the turn orchestrator,
//! the SSE debounce layer, and the provider wire parsers — runs exactly as
//! it does in production; only the LLM endpoint is stubbed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State as AxumState;
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;

use sa_domain::config::{Config, ProviderKind, ProviderProfile};
use sa_gateway::runtime::approval::ApprovalStore;
use sa_gateway::runtime::cancel::CancelMap;
use sa_gateway::runtime::session_lock::SessionLockMap;
use sa_gateway::runtime::tools::ToolDispatcher;
use sa_gateway::state::AppState;
use sa_providers::registry::ProviderRegistry;
use sa_sessions::{SessionStore, TranscriptStore};

/// A local server that pops a canned SSE body off a queue each time it is
/// hit, so each provider round in a multi-round scenario gets its own
/// scripted response.
#[derive(Clone)]
struct ScriptedUpstream {
    bodies: Arc<Mutex<std::collections::VecDeque<String>>>,
}

async fn scripted_handler(AxumState(state): AxumState<ScriptedUpstream>, _body: axum::body::Bytes) -> String {
    state.bodies.lock().pop_front().expect("scripted upstream ran out of canned responses")
}

async fn spawn_scripted_upstream(path: &'static str, bodies: Vec<&str>) -> SocketAddr {
    let state = ScriptedUpstream {
        bodies: Arc::new(Mutex::new(bodies.into_iter().map(str::to_string).collect())),
    };
    let app = Router::new().route(path, post(scripted_handler)).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Build a real `AppState` wired exactly like `main.rs`, pointed at a
/// scripted upstream and a deliberately nonexistent `tool-host` binary so
/// tool dispatch fails fast and deterministically (`tool_host_unreachable`)
/// instead of needing a real subprocess.
async fn build_state(
    tmp: &std::path::Path,
    kind: ProviderKind,
    base_url: String,
    approvals_timeout_ms: u64,
) -> AppState {
    let mut config = Config::default();
    config.server.root = tmp.to_string_lossy().into_owned();
    config.approvals.timeout_ms = approvals_timeout_ms;
    config.tools.tool_host_binary = Some("/nonexistent/tool-host-stub".into());
    config.providers = vec![ProviderProfile {
        id: "stub".into(),
        kind,
        base_url: Some(base_url),
        model: Some("stub-model".into()),
        is_default: true,
    }];

    let providers = Arc::new(ProviderRegistry::new(config.providers.clone()));
    let sessions = Arc::new(SessionStore::new(&tmp.join(".eclia")).unwrap());
    let transcripts = Arc::new(TranscriptStore::new(&tmp.join(&config.sessions.path)).unwrap());
    let session_locks = Arc::new(SessionLockMap::new());
    let cancel_map = Arc::new(CancelMap::new());
    let approvals = Arc::new(ApprovalStore::new(std::time::Duration::from_millis(config.approvals.timeout_ms)));
    let tools = Arc::new(ToolDispatcher::spawn(&config, tmp.to_path_buf()).await.unwrap());

    AppState {
        config: Arc::new(config),
        providers,
        sessions,
        transcripts,
        session_locks,
        cancel_map,
        approvals,
        tools,
        api_token_hash: None,
        root: tmp.to_path_buf(),
    }
}

async fn spawn_router(state: AppState) -> SocketAddr {
    let app = sa_gateway::api::router(state.clone()).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Post one chat turn and return its SSE frames as `(event_name, data)`
/// pairs, in wire order.
async fn post_chat(addr: SocketAddr, session_id: &str, user_text: &str, tool_access_mode: &str) -> Vec<(String, Value)> {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/api/chat"))
        .json(&serde_json::json!({
            "sessionId": session_id,
            "userText": user_text,
            "toolAccessMode": tool_access_mode,
        }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success(), "unexpected status: {}", resp.status());
    let body = resp.text().await.unwrap();
    parse_sse(&body)
}

fn parse_sse(body: &str) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    for frame in body.split("\n\n") {
        let mut event = None;
        let mut data = None;
        for line in frame.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                event = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                data = Some(rest.trim().to_string());
            }
        }
        if let (Some(event), Some(data)) = (event, data) {
            out.push((event, serde_json::from_str(&data).unwrap()));
        }
    }
    out
}

static PORT_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_session_id() -> String {
    let n = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("s-{:016x}-{:08x}", n as u128 + 1, n)
}

fn openai_frame(delta_json: &str, finish_reason: Option<&str>) -> String {
    let finish = finish_reason.map(|r| format!("\"{r}\"")).unwrap_or_else(|| "null".into());
    format!(
        "data: {{\"choices\":[{{\"delta\":{delta_json},\"finish_reason\":{finish}}}]}}\n\n"
    )
}

fn openai_sse_body(frames: &[String]) -> String {
    let mut body = String::new();
    for f in frames {
        body.push_str(f);
    }
    body.push_str("data: [DONE]\n\n");
    body
}

/// A single-delta `tool_calls` frame, built through `serde_json::json!` so
/// the `arguments` field (itself JSON-encoded text inside the wire JSON) is
/// escaped correctly without any hand-written backslashes.
fn openai_tool_call_frame(call_id: &str, name: &str, arguments_json: &str) -> String {
    let frame = serde_json::json!({
        "choices": [{
            "delta": {
                "tool_calls": [{
                    "index": 0,
                    "id": call_id,
                    "function": { "name": name, "arguments": arguments_json }
                }]
            },
            "finish_reason": null
        }]
    });
    format!("data: {frame}\n\n")
}

// Scenario 1: happy path, no tools.
#[tokio::test]
async fn happy_path_no_tools_coalesces_into_one_assistant_record() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream_body = openai_sse_body(&[
        openai_frame(r#"{"content":"He"}"#, None),
        openai_frame(r#"{"content":"llo"}"#, Some("stop")),
    ]);
    let upstream = spawn_scripted_upstream("/chat/completions", vec![upstream_body.as_str()]).await;
    let state = build_state(tmp.path(), ProviderKind::OpenaiCompatible, format!("http://{upstream}"), 300_000).await;
    let addr = spawn_router(state).await;

    let frames = post_chat(addr, &unique_session_id(), "hi", "safe").await;

    let names: Vec<&str> = frames.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["meta", "assistant", "final", "done"]);

    let assistant = &frames[1].1;
    assert_eq!(assistant["text"], "Hello");
    assert_eq!(assistant["toolCalls"], serde_json::json!([]));
    assert_eq!(assistant["reason"], "done");

    assert_eq!(frames[2].1["text"], "Hello");
}

// Scenario 2: cumulative-snapshot streaming must not duplicate text.
#[tokio::test]
async fn cumulative_deltas_do_not_duplicate_text() {
    let tmp = tempfile::tempdir().unwrap();
    let upstream_body = openai_sse_body(&[
        openai_frame(r#"{"content":"He"}"#, None),
        openai_frame(r#"{"content":"Hello"}"#, None),
        openai_frame(r#"{"content":"Hello!"}"#, Some("stop")),
    ]);
    let upstream = spawn_scripted_upstream("/chat/completions", vec![upstream_body.as_str()]).await;
    let state = build_state(tmp.path(), ProviderKind::OpenaiCompatible, format!("http://{upstream}"), 300_000).await;
    let addr = spawn_router(state).await;

    let frames = post_chat(addr, &unique_session_id(), "hi", "safe").await;

    let final_frame = frames.iter().find(|(n, _)| n == "final").unwrap();
    assert_eq!(final_frame.1["text"], "Hello!");
}

// Scenario 3: tool loop, auto-approved (full access mode).
#[tokio::test]
async fn tool_loop_auto_approved_dispatches_and_continues() {
    let tmp = tempfile::tempdir().unwrap();
    let round1 = openai_sse_body(&[openai_tool_call_frame("call_1", "exec", r#"{"command":"ls"}"#)]);
    let round2 = openai_sse_body(&[openai_frame(r#"{"content":"Done."}"#, Some("stop"))]);
    let upstream = spawn_scripted_upstream("/chat/completions", vec![round1.as_str(), round2.as_str()]).await;
    let state = build_state(tmp.path(), ProviderKind::OpenaiCompatible, format!("http://{upstream}"), 300_000).await;
    let addr = spawn_router(state).await;

    let frames = post_chat(addr, &unique_session_id(), "please run ls", "full").await;
    let names: Vec<&str> = frames.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        names,
        vec!["meta", "tool_call", "assistant", "tool_result", "assistant", "final", "done"]
    );

    let tool_call = &frames[1].1;
    assert_eq!(tool_call["name"], "exec");
    assert_eq!(tool_call["args"]["approval"]["required"], false);

    let tool_result = &frames[3].1;
    assert_eq!(tool_result["ok"], false);
    assert_eq!(tool_result["result"]["error"]["code"], "tool_host_unreachable");

    let final_assistant = &frames[4].1;
    assert_eq!(final_assistant["text"], "Done.");
    assert_eq!(final_assistant["reason"], "done");
}

// Scenario 4: safe-mode approval times out and denies the call.
#[tokio::test]
async fn safe_mode_approval_times_out_and_denies() {
    let tmp = tempfile::tempdir().unwrap();
    let round1 = openai_sse_body(&[openai_tool_call_frame("call_1", "exec", r#"{"command":"ls"}"#)]);
    let round2 = openai_sse_body(&[openai_frame(r#"{"content":"Sorry."}"#, Some("stop"))]);
    let upstream = spawn_scripted_upstream("/chat/completions", vec![round1.as_str(), round2.as_str()]).await;
    let state = build_state(tmp.path(), ProviderKind::OpenaiCompatible, format!("http://{upstream}"), 50).await;
    let addr = spawn_router(state).await;

    let frames = post_chat(addr, &unique_session_id(), "please run ls", "safe").await;

    let tool_call = frames.iter().find(|(n, _)| n == "tool_call").unwrap();
    assert_eq!(tool_call.1["args"]["approval"]["required"], true);
    assert!(tool_call.1["args"]["approval"]["id"].is_string());

    let tool_result = frames.iter().find(|(n, _)| n == "tool_result").unwrap();
    assert_eq!(tool_result.1["ok"], false);
    assert_eq!(tool_result.1["result"]["error"]["code"], "approval_timeout");
    assert_eq!(tool_result.1["result"]["error"]["message"], "tool call was not approved");

    let final_frame = frames.iter().find(|(n, _)| n == "final").unwrap();
    assert_eq!(final_frame.1["text"], "Sorry.");
}

// Scenario 5: Anthropic tool_use argument reconstruction must not
// double-prefix when a delta stream is present.
#[tokio::test]
async fn anthropic_tool_use_args_are_not_double_prefixed() {
    let tmp = tempfile::tempdir().unwrap();
    let events = vec![
        serde_json::json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": { "type": "tool_use", "id": "call_1", "name": "exec", "input": {} }
        }),
        serde_json::json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "input_json_delta", "partial_json": r#"{"cmd":"# }
        }),
        serde_json::json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "input_json_delta", "partial_json": r#""ls"}"# }
        }),
        serde_json::json!({
            "type": "message_delta",
            "delta": { "stop_reason": "tool_use" }
        }),
        serde_json::json!({ "type": "message_stop" }),
    ];
    let mut body = String::new();
    for event in &events {
        body.push_str(&format!("data: {event}\n\n"));
    }
    let upstream = spawn_scripted_upstream("/v1/messages", vec![body.as_str()]).await;
    let state = build_state(tmp.path(), ProviderKind::Anthropic, format!("http://{upstream}"), 300_000).await;
    let addr = spawn_router(state).await;

    let frames = post_chat(addr, &unique_session_id(), "please run ls", "full").await;

    let tool_call = frames.iter().find(|(n, _)| n == "tool_call").unwrap();
    assert_eq!(tool_call.1["args"]["raw"], r#"{"cmd":"ls"}"#);
}

// Scenario 6: concurrent requests on the same session serialize through the
// session lock rather than interleaving their transcript writes.
#[tokio::test]
async fn concurrent_same_session_requests_serialize() {
    let tmp = tempfile::tempdir().unwrap();
    let reply1 = openai_sse_body(&[openai_frame(r#"{"content":"first"}"#, Some("stop"))]);
    let reply2 = openai_sse_body(&[openai_frame(r#"{"content":"second"}"#, Some("stop"))]);
    let upstream = spawn_scripted_upstream("/chat/completions", vec![reply1.as_str(), reply2.as_str()]).await;
    let state = build_state(tmp.path(), ProviderKind::OpenaiCompatible, format!("http://{upstream}"), 300_000).await;
    let addr = spawn_router(state).await;
    let session_id = unique_session_id();

    let first = tokio::spawn({
        let session_id = session_id.clone();
        async move { post_chat(addr, &session_id, "one", "safe").await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let second = tokio::spawn({
        let session_id = session_id.clone();
        async move { post_chat(addr, &session_id, "two", "safe").await }
    });

    let (first, second) = tokio::join!(first, second);
    first.unwrap();
    second.unwrap();

    // Give the transcript append for the second (later-locked) turn a moment
    // to land — both HTTP responses have already completed by this point.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let messages = state.transcripts.effective_messages(&session_id).unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].text(), "one");
    assert_eq!(messages[1].text(), "first");
    assert_eq!(messages[2].text(), "two");
    assert_eq!(messages[3].text(), "second");
}
