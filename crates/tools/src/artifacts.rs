//! Post-processing for oversized tool results.
//!
//! After a tool call returns, any `exec_result` whose `stdout`/`stderr`
//! exceeds the inline threshold is externalized to a file under
//! `<root>/.eclia/artifacts/<session>/<callId>_<field>.txt`; the inline
//! value is replaced with a preview, and a descriptor is appended so the
//! caller can surface a download link.

use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::exec::ExecResult;

pub const INLINE_THRESHOLD_BYTES: usize = 24_000;
pub const PREVIEW_BYTES: usize = 12_000;
const HASH_MAX_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub field: String,
    pub path: String,
    pub uri: String,
    pub bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Externalize any oversized field of `result`, writing files under
/// `<root>/.eclia/artifacts/<session>/`. Returns the (possibly unchanged)
/// result plus any artifacts produced, preview-trimmed inline.
pub async fn externalize(
    root: &Path,
    session: &str,
    call_id: &str,
    mut result: ExecResult,
) -> (ExecResult, Vec<Artifact>) {
    let mut artifacts = Vec::new();

    if let Some(art) = externalize_field(root, session, call_id, "stdout", &mut result.stdout).await {
        artifacts.push(art);
    }
    if let Some(art) = externalize_field(root, session, call_id, "stderr", &mut result.stderr).await {
        artifacts.push(art);
    }

    (result, artifacts)
}

async fn externalize_field(
    root: &Path,
    session: &str,
    call_id: &str,
    field: &str,
    value: &mut String,
) -> Option<Artifact> {
    if value.len() <= INLINE_THRESHOLD_BYTES {
        return None;
    }

    let dir = root.join(".eclia").join("artifacts").join(session);
    if tokio::fs::create_dir_all(&dir).await.is_err() {
        return None;
    }

    let file_name = format!("{call_id}_{field}.txt");
    let file_path = dir.join(&file_name);
    let bytes = value.as_bytes();
    if tokio::fs::write(&file_path, bytes).await.is_err() {
        return None;
    }

    let sha256 = if bytes.len() as u64 <= HASH_MAX_BYTES {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Some(hex::encode(hasher.finalize()))
    } else {
        None
    };

    let preview = utf8_prefix(value, PREVIEW_BYTES);
    let rel_path = relative_artifact_path(session, &file_name);
    *value = format!(
        "{preview}\n…[truncated, full saved to {}]",
        rel_path.display()
    );

    Some(Artifact {
        field: field.to_string(),
        path: rel_path.to_string_lossy().into_owned(),
        uri: format!("eclia://artifact/{}", url_encode_path(&rel_path)),
        bytes: bytes.len(),
        sha256,
    })
}

fn relative_artifact_path(session: &str, file_name: &str) -> PathBuf {
    Path::new(session).join(file_name)
}

fn utf8_prefix(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn url_encode_path(path: &Path) -> String {
    path.to_string_lossy()
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'/' => {
                (b as char).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_result(stdout: String) -> ExecResult {
        ExecResult {
            ok: true,
            exit_code: Some(0),
            stdout,
            stderr: String::new(),
            truncated: crate::exec::Truncated::default(),
            error: None,
        }
    }

    #[tokio::test]
    async fn small_output_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let result = exec_result("hello".to_string());
        let (result, artifacts) = externalize(dir.path(), "sess1", "call1", result).await;
        assert_eq!(result.stdout, "hello");
        assert!(artifacts.is_empty());
    }

    #[tokio::test]
    async fn oversized_output_is_externalized() {
        let dir = tempfile::tempdir().unwrap();
        let big = "x".repeat(INLINE_THRESHOLD_BYTES + 1000);
        let result = exec_result(big.clone());
        let (result, artifacts) = externalize(dir.path(), "sess1", "call1", result).await;

        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].field, "stdout");
        assert_eq!(artifacts[0].bytes, big.len());
        assert!(artifacts[0].sha256.is_some());
        assert!(result.stdout.contains("truncated"));
        assert!(result.stdout.len() < big.len());

        let saved = tokio::fs::read_to_string(dir.path().join(".eclia/artifacts/sess1/call1_stdout.txt"))
            .await
            .unwrap();
        assert_eq!(saved, big);
    }

    #[test]
    fn url_encoding_escapes_spaces() {
        let encoded = url_encode_path(Path::new("sess 1/call.txt"));
        assert_eq!(encoded, "sess%201/call.txt");
    }
}
