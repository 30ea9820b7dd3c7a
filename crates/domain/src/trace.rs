use serde::Serialize;

/// Structured trace events emitted across every gateway crate. Each variant
/// is serialized as a single JSON object and logged through `tracing` as one
/// field, following the project's established "log the whole event as JSON"
/// convention rather than scattering ad-hoc `tracing::info!` call sites.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionResolved {
        session_id: String,
        is_new: bool,
    },
    SessionReset {
        session_id: String,
        new_session_id: String,
    },
    TranscriptAppend {
        session_id: String,
        record_type: String,
    },
    TurnStarted {
        session_id: String,
        route_key: String,
        iteration: u32,
    },
    TurnFinished {
        session_id: String,
        iteration: u32,
        finish_reason: Option<String>,
        duration_ms: u64,
    },
    ContextBuilt {
        session_id: String,
        used_tokens: u64,
        dropped: usize,
    },
    ToolDispatched {
        session_id: String,
        call_id: String,
        tool_name: String,
        ok: bool,
        duration_ms: u64,
    },
    ApprovalCreated {
        approval_id: String,
        session_id: String,
        tool_name: String,
    },
    ApprovalDecided {
        approval_id: String,
        session_id: String,
        decision: String,
        timed_out: bool,
    },
    CodexSpawned {
        binary: String,
        pid: Option<u32>,
    },
    CodexExited {
        binary: String,
        diagnostic: String,
    },
    SseRecordEmitted {
        session_id: String,
        event: String,
    },
    LlmRequest {
        provider: String,
        model: String,
        streaming: bool,
        duration_ms: u64,
        prompt_tokens: Option<u32>,
        completion_tokens: Option<u32>,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "gateway_event");
    }
}
