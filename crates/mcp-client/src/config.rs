//! MCP configuration types.
//!
//! The gateway's Tool Dispatcher (C9, §4.9) spawns exactly one MCP-stdio
//! tool-host child process; this crate keeps the connection-config shape
//! general enough to address more than one server (the manager already
//! supports it), but the gateway only ever configures the one tool host.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level MCP configuration: the list of servers the manager connects to.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

/// Configuration for a single MCP server connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Unique identifier for this server (used in tool naming: `mcp:{id}:{tool}`).
    pub id: String,

    /// The command to spawn (e.g. the tool-host binary path).
    #[serde(default)]
    pub command: String,

    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Transport type.
    #[serde(default)]
    pub transport: McpTransportKind,

    /// Optional URL for SSE transport.
    #[serde(default)]
    pub url: Option<String>,

    /// Optional environment variables to set on the spawned process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Transport kind for connecting to an MCP server. Only `Stdio` is wired up
/// end-to-end; `Sse` is carried as a stub for a future remote tool host.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    #[default]
    Stdio,
    Sse,
}
