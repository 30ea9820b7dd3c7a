use serde::Serialize;

/// Shared error type used across every gateway crate. Variant names mirror
/// the error-kind taxonomy in §7: client errors, auth errors, upstream
/// errors, tool/approval errors (which are usually folded into a tool result
/// rather than propagated as an `Error`), and loop errors.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    // ── Client errors (HTTP 400) ────────────────────────────────────
    #[error("invalid session id")]
    InvalidSessionId,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("wrong session")]
    WrongSession,

    // ── Auth errors ──────────────────────────────────────────────────
    #[error("missing credential: {0}")]
    MissingCredential(String),
    #[error("unauthorized")]
    Unauthorized,

    // ── Upstream errors ──────────────────────────────────────────────
    #[error("upstream error: {status}")]
    UpstreamHttp { status: u16, message: String },
    #[error("upstream stream error: {0}")]
    UpstreamStream(String),
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    // ── Tool errors (usually surfaced as a tool-result, not this type) ─
    #[error("tool host unreachable: {0}")]
    ToolHostUnreachable(String),
    #[error("bad tool args: {0}")]
    BadToolArgs(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    // ── Loop errors ────────────────────────────────────────────────────
    #[error("too many turns (> {0})")]
    TooManyTurns(u32),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable machine-readable code, used as the `error` field of HTTP JSON
    /// error bodies and SSE `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) => "io_error",
            Error::Json(_) => "json_error",
            Error::Http(_) => "http_error",
            Error::Timeout(_) => "timeout",
            Error::Provider { .. } => "provider_error",
            Error::InvalidSessionId => "invalid_session_id",
            Error::BadRequest(_) => "bad_request",
            Error::MethodNotAllowed => "method_not_allowed",
            Error::NotFound(_) => "not_found",
            Error::WrongSession => "wrong_session",
            Error::MissingCredential(_) => "missing_credential",
            Error::Unauthorized => "unauthorized",
            Error::UpstreamHttp { .. } => "upstream_http",
            Error::UpstreamStream(_) => "upstream_stream_error",
            Error::FetchFailed(_) => "fetch_failed",
            Error::ToolHostUnreachable(_) => "tool_host_unreachable",
            Error::BadToolArgs(_) => "bad_tool_args",
            Error::UnknownTool(_) => "unknown_tool",
            Error::TooManyTurns(_) => "too_many_turns",
            Error::Config(_) => "config_error",
            Error::Other(_) => "error",
        }
    }

    /// HTTP status code for errors surfaced directly as an HTTP response
    /// (as opposed to folded into an SSE `error` event or a tool result).
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidSessionId
            | Error::BadRequest(_)
            | Error::BadToolArgs(_)
            | Error::UnknownTool(_) => 400,
            Error::Unauthorized => 401,
            Error::MethodNotAllowed => 405,
            Error::NotFound(_) => 404,
            Error::WrongSession => 409,
            Error::MissingCredential(_) => 424,
            Error::UpstreamHttp { status, .. } => *status,
            Error::TooManyTurns(_) => 508,
            _ => 500,
        }
    }
}

/// `{ok:false, error, hint?}` JSON error body shape (§7).
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub ok: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl From<&Error> for ErrorBody {
    fn from(e: &Error) -> Self {
        Self {
            ok: false,
            error: e.code().to_string(),
            hint: Some(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_strings() {
        assert_eq!(Error::InvalidSessionId.code(), "invalid_session_id");
        assert_eq!(Error::WrongSession.code(), "wrong_session");
        assert_eq!(Error::TooManyTurns(24).code(), "too_many_turns");
    }

    #[test]
    fn upstream_http_status_passes_through() {
        let e = Error::UpstreamHttp { status: 503, message: "unavailable".into() };
        assert_eq!(e.http_status(), 503);
    }

    #[test]
    fn missing_credential_maps_to_424() {
        assert_eq!(Error::MissingCredential("no key".into()).http_status(), 424);
    }
}
