//! Tool Dispatcher (C9, §4.9): owns the MCP-stdio connection to the
//! `tool-host` subprocess, exposes its tools to the turn orchestrator, and
//! decides whether a given call requires human approval before it runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use regex::RegexSet;
use sa_domain::config::Config;
use sa_domain::error::Result;
use sa_domain::tool::ToolDefinition;
use sa_domain::trace::TraceEvent;
use sa_mcp_client::{McpConfig, McpManager, McpServerConfig, McpTransportKind};
use sa_tools::exec::ExecResult;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// The only MCP server the gateway ever configures.
const TOOL_HOST_SERVER_ID: &str = "tool-host";

/// Whether the orchestrator is willing to run risky tool calls without a
/// human in the loop for this turn (§4.10(d)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolAccessMode {
    #[default]
    Safe,
    Full,
}

/// The policy verdict for one tool call: whether it must wait on the
/// Approval Hub before dispatch, and why.
#[derive(Debug, Clone)]
pub struct ToolSafetyCheck {
    pub require_approval: bool,
    pub reason: Option<String>,
    pub matched_allowlist: Option<String>,
}

/// Wraps the `tool-host` MCP connection: tool discovery, the safe/full
/// approval policy, and dispatch (including artifact externalization for
/// oversized `exec` output).
pub struct ToolDispatcher {
    mcp: Arc<McpManager>,
    root: PathBuf,
    exec_allowlist: RegexSet,
}

impl ToolDispatcher {
    /// Spawn the `tool-host` subprocess and complete the MCP handshake. A
    /// server that fails to start leaves the dispatcher with zero tools
    /// rather than failing startup (`McpManager::from_config` logs and
    /// skips) — the gateway still serves chat, just without tool calls.
    pub async fn spawn(config: &Config, root: PathBuf) -> Result<Self> {
        let binary = resolve_tool_host_binary(config, &root);
        let exec_allowlist = RegexSet::new(&config.tools.exec_allowlist_patterns).map_err(|e| {
            sa_domain::error::Error::Config(format!("invalid exec_allowlist_patterns: {e}"))
        })?;

        let server = McpServerConfig {
            id: TOOL_HOST_SERVER_ID.to_string(),
            command: binary.to_string_lossy().into_owned(),
            args: Vec::new(),
            transport: McpTransportKind::Stdio,
            url: None,
            env: std::collections::HashMap::from([(
                "TOOL_HOST_ROOT".to_string(),
                root.to_string_lossy().into_owned(),
            )]),
        };
        let mcp = McpManager::from_config(&McpConfig {
            servers: vec![server],
        })
        .await;

        Ok(Self {
            mcp: Arc::new(mcp),
            root,
            exec_allowlist,
        })
    }

    /// Tool definitions to advertise to the LLM, across every live MCP
    /// server (in practice, only `tool-host`).
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.mcp
            .list_tools()
            .into_iter()
            .map(|(_, tool)| ToolDefinition {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
            })
            .collect()
    }

    pub fn is_known_tool(&self, name: &str) -> bool {
        self.mcp.list_tools().into_iter().any(|(_, t)| t.name == name)
    }

    /// Decide whether `tool_name(args)` needs human approval. `full` access
    /// mode never requires it; `safe` mode requires it for everything except
    /// `exec` calls whose command matches `exec_allowlist_patterns`.
    pub fn check_safety(&self, tool_name: &str, args: &Value, mode: ToolAccessMode) -> ToolSafetyCheck {
        if mode == ToolAccessMode::Full {
            return ToolSafetyCheck {
                require_approval: false,
                reason: None,
                matched_allowlist: None,
            };
        }

        if tool_name == "exec" {
            if let Some(command) = exec_command_candidate(args) {
                if let Some(pattern) = self.matching_allowlist_pattern(&command) {
                    return ToolSafetyCheck {
                        require_approval: false,
                        reason: None,
                        matched_allowlist: Some(pattern),
                    };
                }
            }
            return ToolSafetyCheck {
                require_approval: true,
                reason: Some(
                    "exec calls require approval unless they match an allowlist pattern".into(),
                ),
                matched_allowlist: None,
            };
        }

        ToolSafetyCheck {
            require_approval: true,
            reason: Some(format!("'{tool_name}' requires approval in safe mode")),
            matched_allowlist: None,
        }
    }

    fn matching_allowlist_pattern(&self, command: &str) -> Option<String> {
        let idx = self.exec_allowlist.matches(command).into_iter().next()?;
        self.exec_allowlist.patterns().get(idx).cloned()
    }

    /// Dispatch a tool call through MCP, post-processing `exec` output that
    /// exceeds the inline threshold into an artifact descriptor. Returns the
    /// result value to attach to the `tool_result` event/transcript plus
    /// whether the call succeeded.
    pub async fn dispatch(
        &self,
        session_id: &str,
        call_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> (Value, bool) {
        let started = Instant::now();
        let (value, ok) = self.dispatch_inner(session_id, call_id, tool_name, arguments).await;
        TraceEvent::ToolDispatched {
            session_id: session_id.to_string(),
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            ok,
            duration_ms: started.elapsed().as_millis() as u64,
        }
        .emit();
        (value, ok)
    }

    async fn dispatch_inner(
        &self,
        session_id: &str,
        call_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> (Value, bool) {
        let response = match self
            .mcp
            .call_tool(TOOL_HOST_SERVER_ID, tool_name, arguments)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return (
                    json!({
                        "ok": false,
                        "error": { "code": "tool_host_unreachable", "message": e.to_string() },
                    }),
                    false,
                )
            }
        };

        let text = response
            .content
            .first()
            .map(|c| c.text.clone())
            .unwrap_or_default();
        let mut value: Value = serde_json::from_str(&text)
            .unwrap_or_else(|_| json!({ "ok": !response.is_error, "raw": text }));

        if tool_name == "exec" {
            if let Ok(exec_result) = serde_json::from_value::<ExecResult>(value.clone()) {
                let (updated, artifacts) =
                    sa_tools::artifacts::externalize(&self.root, session_id, call_id, exec_result)
                        .await;
                if let Ok(mut updated_value) = serde_json::to_value(&updated) {
                    if !artifacts.is_empty() {
                        if let Ok(artifacts_value) = serde_json::to_value(&artifacts) {
                            if let Some(obj) = updated_value.as_object_mut() {
                                obj.insert("artifacts".to_string(), artifacts_value);
                            }
                        }
                    }
                    value = updated_value;
                }
            }
        }

        let ok = value
            .get("ok")
            .and_then(Value::as_bool)
            .unwrap_or(!response.is_error);
        (value, ok)
    }

    pub async fn shutdown(&self) {
        self.mcp.shutdown().await;
    }
}

fn exec_command_candidate(args: &Value) -> Option<String> {
    args.get("command")
        .and_then(Value::as_str)
        .or_else(|| args.get("cmd").and_then(Value::as_str))
        .map(str::to_string)
}

fn resolve_tool_host_binary(config: &Config, root: &std::path::Path) -> PathBuf {
    if let Some(configured) = config.tools.tool_host_binary.as_ref().filter(|s| !s.is_empty()) {
        let path = PathBuf::from(configured);
        return if path.is_absolute() { path } else { root.join(path) };
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("tool-host")))
        .unwrap_or_else(|| PathBuf::from("tool-host"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(patterns: &[&str]) -> ToolDispatcher {
        ToolDispatcher {
            mcp: Arc::new(McpManager::empty()),
            root: std::env::temp_dir(),
            exec_allowlist: RegexSet::new(patterns).unwrap(),
        }
    }

    #[test]
    fn full_mode_never_requires_approval() {
        let d = dispatcher(&[]);
        let check = d.check_safety("exec", &json!({"command": "rm -rf /"}), ToolAccessMode::Full);
        assert!(!check.require_approval);
    }

    #[test]
    fn safe_mode_requires_approval_with_empty_allowlist() {
        let d = dispatcher(&[]);
        let check = d.check_safety("exec", &json!({"command": "ls"}), ToolAccessMode::Safe);
        assert!(check.require_approval);
    }

    #[test]
    fn safe_mode_allows_matching_command() {
        let d = dispatcher(&[r"^ls(\s|$)", r"^git status$"]);
        let check = d.check_safety("exec", &json!({"command": "ls -la"}), ToolAccessMode::Safe);
        assert!(!check.require_approval);
        assert!(check.matched_allowlist.is_some());
    }

    #[test]
    fn safe_mode_denies_non_matching_command() {
        let d = dispatcher(&[r"^git status$"]);
        let check = d.check_safety("exec", &json!({"command": "rm -rf /"}), ToolAccessMode::Safe);
        assert!(check.require_approval);
    }

    #[test]
    fn unknown_tool_requires_approval_in_safe_mode() {
        let d = dispatcher(&[]);
        let check = d.check_safety("some_other_tool", &json!({}), ToolAccessMode::Safe);
        assert!(check.require_approval);
    }

    #[test]
    fn cmd_field_is_used_when_command_is_absent() {
        let d = dispatcher(&[r"^ls$"]);
        let check = d.check_safety("exec", &json!({"cmd": "ls"}), ToolAccessMode::Safe);
        assert!(!check.require_approval);
    }
}
