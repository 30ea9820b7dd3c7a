//! MCP-stdio tool host: the subprocess the gateway's Tool Dispatcher (C9)
//! spawns and speaks JSON-RPC 2.0 to over stdin/stdout. Exposes one tool,
//! `exec`. Refuses `tools/*` until `notifications/initialized` has been
//! received, per the MCP handshake.

use std::future::pending;
use std::path::PathBuf;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use sa_mcp_client::protocol::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpToolDef, ToolCallContent, ToolCallResult,
    ToolsListResult,
};

const PROTOCOL_VERSION: &str = "2025-06-18";
const NOT_INITIALIZED: i64 = -32002;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

fn exec_tool_def() -> McpToolDef {
    McpToolDef {
        name: "exec".to_string(),
        description: "Run a single shell command or argv to completion and return its output."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "cmd": {"type": "string"},
                "args": {"type": "array", "items": {"type": "string"}},
                "command": {"type": "string"},
                "cwd": {"type": "string"},
                "timeoutMs": {"type": "integer"},
                "maxStdoutBytes": {"type": "integer"},
                "maxStderrBytes": {"type": "integer"},
                "env": {"type": "object", "additionalProperties": {"type": "string"}}
            }
        }),
    }
}

fn root_dir() -> PathBuf {
    std::env::var("TOOL_HOST_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

async fn handle_request(req: &JsonRpcRequest, initialized: &mut bool) -> JsonRpcResponse {
    match req.method.as_str() {
        "initialize" => JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: req.id,
            result: Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "sa-tool-host", "version": env!("CARGO_PKG_VERSION")},
            })),
            error: None,
        },
        "tools/list" if *initialized => {
            let result = ToolsListResult {
                tools: vec![exec_tool_def()],
            };
            JsonRpcResponse {
                jsonrpc: "2.0".into(),
                id: req.id,
                result: serde_json::to_value(result).ok(),
                error: None,
            }
        }
        "tools/call" if *initialized => handle_tools_call(req).await,
        "tools/list" | "tools/call" => error_response(
            req.id,
            NOT_INITIALIZED,
            "server not initialized: send notifications/initialized first",
        ),
        other => error_response(req.id, METHOD_NOT_FOUND, format!("unknown method: {other}")),
    }
}

async fn handle_tools_call(req: &JsonRpcRequest) -> JsonRpcResponse {
    let params = match &req.params {
        Some(p) => p,
        None => return error_response(req.id, INVALID_PARAMS, "missing params"),
    };

    let name = match params.get("name").and_then(Value::as_str) {
        Some(n) => n,
        None => return error_response(req.id, INVALID_PARAMS, "missing tool name"),
    };

    if name != "exec" {
        return error_response(req.id, INVALID_PARAMS, format!("unknown tool: {name}"));
    }

    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
    let exec_req: sa_tools::exec::ExecRequest = match serde_json::from_value(arguments) {
        Ok(r) => r,
        Err(e) => {
            return error_response(req.id, INVALID_PARAMS, format!("bad exec arguments: {e}"))
        }
    };

    let root = root_dir();
    let result = sa_tools::exec::run(&root, exec_req, pending()).await;
    let is_error = !result.ok;
    let text = serde_json::to_string(&result).unwrap_or_else(|_| "{}".to_string());

    let call_result = ToolCallResult {
        content: vec![ToolCallContent {
            content_type: "text".to_string(),
            text,
        }],
        is_error,
    };

    JsonRpcResponse {
        jsonrpc: "2.0".into(),
        id: req.id,
        result: serde_json::to_value(call_result).ok(),
        error: None,
    }
}

fn error_response(id: u64, code: i64, message: impl Into<String>) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".into(),
        id,
        result: None,
        error: Some(JsonRpcError {
            code,
            message: message.into(),
            data: None,
        }),
    }
}

#[tokio::main]
async fn main() {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut stdout = tokio::io::stdout();
    let mut initialized = false;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(_) => break,
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        // Notifications have no `id`; peek for one before committing to the
        // request shape.
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => continue,
        };

        if value.get("id").is_none() {
            if value.get("method").and_then(Value::as_str) == Some("notifications/initialized") {
                initialized = true;
            }
            continue;
        }

        let req: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(_) => continue,
        };

        let resp = handle_request(&req, &mut initialized).await;
        if let Ok(json) = serde_json::to_string(&resp) {
            let _ = stdout.write_all(json.as_bytes()).await;
            let _ = stdout.write_all(b"\n").await;
            let _ = stdout.flush().await;
        }
    }
}
