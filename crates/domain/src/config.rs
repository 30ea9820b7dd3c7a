use std::fmt;

use serde::{Deserialize, Serialize};

/// Root configuration, loaded from TOML (env var `GATEWAY_CONFIG`, default
/// path `config.toml`) or `Config::default()` if no file is present.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub codex: CodexConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub approvals: ApprovalsConfig,
    #[serde(default)]
    pub providers: Vec<ProviderProfile>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Root directory for `.eclia/` state (token file, artifacts, sessions).
    #[serde(default = "d_root")]
    pub root: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            root: d_root(),
        }
    }
}

fn d_port() -> u16 {
    3210
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_root() -> String {
    ".".into()
}

/// Context Builder (C7) defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "d_token_budget")]
    pub default_token_budget: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_token_budget: d_token_budget(),
        }
    }
}

fn d_token_budget() -> u64 {
    20_000
}

/// Codex Process Bridge (C5) defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexConfig {
    #[serde(default = "d_codex_binary")]
    pub binary: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "d_codex_turn_timeout_ms")]
    pub turn_timeout_ms: u64,
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            binary: d_codex_binary(),
            extra_args: Vec::new(),
            turn_timeout_ms: d_codex_turn_timeout_ms(),
        }
    }
}

fn d_codex_binary() -> String {
    std::env::var("CODEX_BINARY").unwrap_or_else(|_| "codex".into())
}
fn d_codex_turn_timeout_ms() -> u64 {
    300_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "d_sessions_path")]
    pub path: String,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            path: d_sessions_path(),
        }
    }
}

fn d_sessions_path() -> String {
    ".eclia/sessions".into()
}

/// Exec tool (§4.9) defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "d_exec_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "d_max_stdout_bytes")]
    pub max_stdout_bytes: usize,
    #[serde(default = "d_max_stderr_bytes")]
    pub max_stderr_bytes: usize,
    #[serde(default = "d_artifact_threshold_bytes")]
    pub artifact_threshold_bytes: usize,
    #[serde(default = "d_artifact_preview_bytes")]
    pub artifact_preview_bytes: usize,
    /// Regexes matched against the extracted `exec` command in `safe` access
    /// mode (§4.10(d)). A match means the command runs without approval. If
    /// empty, every `exec` call requires approval while in `safe` mode.
    #[serde(default)]
    pub exec_allowlist_patterns: Vec<String>,
    /// Path (relative to `server.root` unless absolute) to the `tool-host`
    /// binary. Defaults to a sibling of the current executable.
    #[serde(default)]
    pub tool_host_binary: Option<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: d_exec_timeout_ms(),
            max_stdout_bytes: d_max_stdout_bytes(),
            max_stderr_bytes: d_max_stderr_bytes(),
            artifact_threshold_bytes: d_artifact_threshold_bytes(),
            artifact_preview_bytes: d_artifact_preview_bytes(),
            exec_allowlist_patterns: Vec::new(),
            tool_host_binary: None,
        }
    }
}

fn d_exec_timeout_ms() -> u64 {
    30_000
}
fn d_max_stdout_bytes() -> usize {
    200_000
}
fn d_max_stderr_bytes() -> usize {
    50_000
}
fn d_artifact_threshold_bytes() -> usize {
    24_000
}
fn d_artifact_preview_bytes() -> usize {
    12_000
}

/// Bearer-token auth source (§6). The token is read once at startup from
/// `token_env` if set and non-empty, else from `<root>/<token_file>` (path
/// trimmed of surrounding whitespace). An empty result on both disables
/// auth (dev mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "d_token_env")]
    pub token_env: String,
    #[serde(default = "d_token_file")]
    pub token_file: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_env: d_token_env(),
            token_file: d_token_file(),
        }
    }
}

fn d_token_env() -> String {
    "GATEWAY_TOKEN".into()
}
fn d_token_file() -> String {
    ".eclia/gateway.token".into()
}

/// Structured logging (ambient, not gated by any spec Non-goal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
    #[serde(default = "d_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            level: d_log_level(),
        }
    }
}

fn d_log_level() -> String {
    "info,sa_gateway=debug".into()
}

/// Approval Hub (C8) defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalsConfig {
    #[serde(default = "d_approval_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: d_approval_timeout_ms(),
        }
    }
}

fn d_approval_timeout_ms() -> u64 {
    300_000
}

/// One upstream profile, selected by `routeKey` (§6): `(kind, id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    OpenaiCompatible,
    Anthropic,
    CodexOauth,
}

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration, returning every issue found. An empty
    /// vec (or one containing only `Warning`s) means startup may proceed;
    /// any `Error` should abort with exit code 1 (§6).
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }
        if self.server.host.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }
        if self.codex.binary.trim().is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "codex.binary".into(),
                message: "binary must not be empty".into(),
            });
        }
        if self.context.default_token_budget == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "context.default_token_budget".into(),
                message: "token budget must be greater than 0".into(),
            });
        }
        if self.providers.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "providers".into(),
                message: "no provider profiles configured; routing will have nothing to select"
                    .into(),
            });
        }
        let default_count = self.providers.iter().filter(|p| p.is_default).count();
        if default_count > 1 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "providers".into(),
                message: "more than one profile marked is_default; first match wins".into(),
            });
        }

        issues
    }

    pub fn has_fatal_issues(&self) -> bool {
        self.validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error)
    }
}
