//! Exec tool — run one command to completion and report its result.
//!
//! Input shape mirrors the MCP `exec` tool contract: exactly one of `cmd`
//! or `command` selects the program. `cmd` is a direct argv (program plus
//! `args`); `command` is a shell line. A bare `cmd` that looks like a shell
//! one-liner — contains whitespace, has no `args`, and does not name an
//! existing file — is auto-promoted to `command` so callers don't have to
//! pick the right field themselves.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_stdout_bytes: Option<usize>,
    #[serde(default)]
    pub max_stderr_bytes: Option<usize>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_STDOUT_BYTES: usize = 200_000;
pub const DEFAULT_MAX_STDERR_BYTES: usize = 50_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Truncated {
    pub stdout: bool,
    pub stderr: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecError {
    pub code: ExecErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecErrorCode {
    Timeout,
    Aborted,
    NonzeroExit,
    SpawnFailed,
    BadCwd,
    MissingCommand,
}

/// The `exec` tool's result, round-tripped as JSON through the MCP
/// `tools/call` content text both by the tool-host subprocess and by the
/// gateway's Tool Dispatcher when externalizing oversized fields (C9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: Truncated,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecError>,
}

impl ExecResult {
    fn failure(code: ExecErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            truncated: Truncated::default(),
            error: Some(ExecError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// What actually gets spawned, after cmd/command disambiguation.
enum Program {
    /// Direct argv: no shell involved.
    Direct { program: String, args: Vec<String> },
    /// A shell one-liner, run through the platform's default shell.
    Shell { command: String },
}

fn looks_like_shell_line(cmd: &str, args: &Option<Vec<String>>) -> bool {
    let has_whitespace = cmd.chars().any(char::is_whitespace);
    let no_args = args.as_ref().map(|a| a.is_empty()).unwrap_or(true);
    let path_exists = Path::new(cmd).exists();
    has_whitespace && no_args && !path_exists
}

fn resolve_program(req: &ExecRequest) -> Result<Program, ExecResult> {
    if let Some(command) = req.command.as_ref().filter(|c| !c.is_empty()) {
        return Ok(Program::Shell {
            command: command.clone(),
        });
    }

    let cmd = match req.cmd.as_ref().filter(|c| !c.is_empty()) {
        Some(c) => c,
        None => {
            return Err(ExecResult::failure(
                ExecErrorCode::MissingCommand,
                "exactly one of `cmd` or `command` must be given",
            ))
        }
    };

    if looks_like_shell_line(cmd, &req.args) {
        return Ok(Program::Shell {
            command: cmd.clone(),
        });
    }

    Ok(Program::Direct {
        program: cmd.clone(),
        args: req.args.clone().unwrap_or_default(),
    })
}

/// Build the platform default shell invocation for a raw command line.
fn shell_invocation(command: &str) -> (String, Vec<String>) {
    if cfg!(target_os = "windows") {
        (
            "cmd.exe".to_string(),
            vec!["/d".into(), "/s".into(), "/c".into(), command.to_string()],
        )
    } else if cfg!(target_os = "macos") {
        ("/bin/zsh".to_string(), vec!["-lc".into(), command.to_string()])
    } else {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
        (shell, vec!["-lc".into(), command.to_string()])
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Resolve `cwd` against `root`. Relative paths that escape `root` fail
/// with `bad_cwd`; absolute paths are an intentional escape hatch.
fn resolve_cwd(root: &Path, cwd: Option<&str>) -> Result<PathBuf, ExecErrorCode> {
    let raw = match cwd {
        None => return Ok(root.to_path_buf()),
        Some(c) if c.is_empty() => return Ok(root.to_path_buf()),
        Some(c) => c,
    };

    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        return Ok(normalize(candidate));
    }

    let resolved = normalize(&root.join(candidate));
    let root_normalized = normalize(root);
    match resolved.strip_prefix(&root_normalized) {
        Ok(rel) if rel.starts_with("..") => Err(ExecErrorCode::BadCwd),
        Ok(_) => Ok(resolved),
        Err(_) => Err(ExecErrorCode::BadCwd),
    }
}

/// Read a pipe up to `cap` bytes, continuing to drain afterward so the
/// child never blocks on a full pipe buffer.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> (Vec<u8>, bool) {
    let mut out = Vec::with_capacity(cap.min(64 * 1024));
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if out.len() < cap {
                    let take = (cap - out.len()).min(n);
                    out.extend_from_slice(&buf[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    (out, truncated)
}

/// Decode captured bytes to a `String`, cutting back to the last valid
/// UTF-8 boundary when the capture was truncated mid-character.
fn decode_captured(mut data: Vec<u8>, was_truncated: bool) -> String {
    if !was_truncated {
        return String::from_utf8_lossy(&data).into_owned();
    }
    loop {
        match std::str::from_utf8(&data) {
            Ok(s) => return s.to_string(),
            Err(e) => data.truncate(e.valid_up_to()),
        }
    }
}

#[cfg(unix)]
fn set_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn set_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

fn augment_darwin_path(env: &mut HashMap<String, String>) {
    if !cfg!(target_os = "macos") {
        return;
    }
    let existing = env
        .get("PATH")
        .cloned()
        .or_else(|| std::env::var("PATH").ok())
        .unwrap_or_default();
    let extra = "/opt/homebrew/bin:/opt/homebrew/sbin";
    let merged = if existing.is_empty() {
        extra.to_string()
    } else {
        format!("{existing}:{extra}")
    };
    env.insert("PATH".to_string(), merged);
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Aborted,
}

/// Run one exec tool invocation to completion.
///
/// `root` is the project root `cwd` is resolved against. `cancel` resolves
/// when an external cancellation signal fires (client disconnect, turn
/// abort); the child's process group is SIGKILLed and the result reports
/// `aborted`.
pub async fn run(
    root: &Path,
    req: ExecRequest,
    cancel: impl std::future::Future<Output = ()>,
) -> ExecResult {
    let program = match resolve_program(&req) {
        Ok(p) => p,
        Err(result) => return result,
    };

    let cwd = match resolve_cwd(root, req.cwd.as_deref()) {
        Ok(c) => c,
        Err(code) => {
            return ExecResult::failure(code, format!("cwd escapes project root: {:?}", req.cwd))
        }
    };

    let (program_name, args) = match &program {
        Program::Direct { program, args } => (program.clone(), args.clone()),
        Program::Shell { command } => shell_invocation(command),
    };

    let mut cmd = Command::new(&program_name);
    cmd.args(&args);
    cmd.current_dir(&cwd);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut env = req.env.clone().unwrap_or_default();
    augment_darwin_path(&mut env);
    for (k, v) in &env {
        cmd.env(k, v);
    }

    set_process_group(&mut cmd);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return ExecResult::failure(
                ExecErrorCode::SpawnFailed,
                format!("failed to spawn `{program_name}`: {e}"),
            )
        }
    };

    let pid = child.id();
    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let max_stdout = req.max_stdout_bytes.unwrap_or(DEFAULT_MAX_STDOUT_BYTES);
    let max_stderr = req.max_stderr_bytes.unwrap_or(DEFAULT_MAX_STDERR_BYTES);

    let stdout_task = tokio::spawn(read_capped(stdout, max_stdout));
    let stderr_task = tokio::spawn(read_capped(stderr, max_stderr));

    let timeout_ms = req.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
    let timeout = tokio::time::sleep(std::time::Duration::from_millis(timeout_ms));
    tokio::pin!(timeout);
    tokio::pin!(cancel);

    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        _ = &mut timeout => Outcome::TimedOut,
        _ = &mut cancel => Outcome::Aborted,
    };

    let (exit_code, early_error) = match outcome {
        Outcome::Exited(Ok(status)) => (status.code(), None),
        Outcome::Exited(Err(e)) => (None, Some((ExecErrorCode::SpawnFailed, e.to_string()))),
        Outcome::TimedOut => {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            let _ = child.wait().await;
            (
                None,
                Some((ExecErrorCode::Timeout, format!("timed out after {timeout_ms}ms"))),
            )
        }
        Outcome::Aborted => {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            let _ = child.wait().await;
            (None, Some((ExecErrorCode::Aborted, "aborted".to_string())))
        }
    };

    let (stdout_bytes, stdout_truncated) = stdout_task.await.unwrap_or_default();
    let (stderr_bytes, stderr_truncated) = stderr_task.await.unwrap_or_default();
    let stdout_text = decode_captured(stdout_bytes, stdout_truncated);
    let stderr_text = decode_captured(stderr_bytes, stderr_truncated);
    let truncated = Truncated {
        stdout: stdout_truncated,
        stderr: stderr_truncated,
    };

    if let Some((code, message)) = early_error {
        return ExecResult {
            ok: false,
            exit_code,
            stdout: stdout_text,
            stderr: stderr_text,
            truncated,
            error: Some(ExecError { code, message }),
        };
    }

    match exit_code {
        Some(0) => ExecResult {
            ok: true,
            exit_code,
            stdout: stdout_text,
            stderr: stderr_text,
            truncated,
            error: None,
        },
        other => ExecResult {
            ok: false,
            exit_code: other,
            stdout: stdout_text,
            stderr: stderr_text,
            truncated,
            error: Some(ExecError {
                code: ExecErrorCode::NonzeroExit,
                message: match other {
                    Some(code) => format!("process exited with status {code}"),
                    None => "process exited without a status code".to_string(),
                },
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;

    fn req(cmd: &str) -> ExecRequest {
        ExecRequest {
            cmd: Some(cmd.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn runs_a_direct_command() {
        let root = std::env::current_dir().unwrap();
        let result = run(&root, req("true"), pending()).await;
        assert!(result.ok);
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let root = std::env::current_dir().unwrap();
        let result = run(&root, req("false"), pending()).await;
        assert!(!result.ok);
        assert_eq!(result.error.unwrap().code, ExecErrorCode::NonzeroExit);
    }

    #[tokio::test]
    async fn missing_command_is_an_error() {
        let root = std::env::current_dir().unwrap();
        let result = run(&root, ExecRequest::default(), pending()).await;
        assert!(!result.ok);
        assert_eq!(result.error.unwrap().code, ExecErrorCode::MissingCommand);
    }

    #[tokio::test]
    async fn shell_one_liner_auto_promotes() {
        let root = std::env::current_dir().unwrap();
        let result = run(&root, req("echo hello world"), pending()).await;
        assert!(result.ok);
        assert!(result.stdout.contains("hello world"));
    }

    #[tokio::test]
    async fn bad_cwd_rejects_root_escape() {
        let root = std::env::current_dir().unwrap();
        let mut r = req("true");
        r.cwd = Some("../../../../../../etc".to_string());
        let result = run(&root, r, pending()).await;
        assert!(!result.ok);
        assert_eq!(result.error.unwrap().code, ExecErrorCode::BadCwd);
    }

    #[tokio::test]
    async fn absolute_cwd_is_allowed() {
        let root = std::env::current_dir().unwrap();
        let mut r = req("true");
        r.cwd = Some("/tmp".to_string());
        let result = run(&root, r, pending()).await;
        assert!(result.ok);
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let root = std::env::current_dir().unwrap();
        let mut r = req("sleep 5");
        r.timeout_ms = Some(50);
        let result = run(&root, r, pending()).await;
        assert!(!result.ok);
        assert_eq!(result.error.unwrap().code, ExecErrorCode::Timeout);
    }

    #[tokio::test]
    async fn stdout_budget_truncates_at_char_boundary() {
        let root = std::env::current_dir().unwrap();
        let mut r = req("printf 'abcdefgh'");
        r.max_stdout_bytes = Some(4);
        let result = run(&root, r, pending()).await;
        assert!(result.truncated.stdout);
        assert_eq!(result.stdout, "abcd");
    }

    #[test]
    fn shell_line_detection() {
        assert!(looks_like_shell_line("echo hi", &None));
        assert!(!looks_like_shell_line("/bin/echo", &Some(vec!["hi".into()])));
        assert!(!looks_like_shell_line("/bin/true", &None));
    }
}
