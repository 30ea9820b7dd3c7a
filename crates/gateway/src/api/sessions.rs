//! Session management (C13, §3): create/ensure a session and reset its
//! effective history.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use sa_domain::error::{Error, ErrorBody};
use sa_domain::transcript::{is_valid_session_id, SessionOrigin, SessionOriginKind};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub session_id: String,
    #[serde(default)]
    pub origin: Option<OriginInput>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginInput {
    pub kind: SessionOriginKind,
    #[serde(default)]
    pub label: Option<String>,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Response {
    if !is_valid_session_id(&body.session_id) {
        return error_response(&Error::InvalidSessionId);
    }

    let origin = body.origin.map(|o| SessionOrigin {
        kind: o.kind,
        label: o.label,
    });
    let (session, is_new) = state.sessions.ensure(&body.session_id, origin);

    Json(serde_json::json!({ "session": session, "isNew": is_new })).into_response()
}

pub async fn reset_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if !is_valid_session_id(&id) {
        return error_response(&Error::InvalidSessionId);
    }
    if state.sessions.get(&id).is_none() {
        return error_response(&Error::NotFound(id));
    }

    let reset_id = uuid::Uuid::new_v4().to_string();
    if let Err(e) = state.transcripts.reset(&id, reset_id, chrono::Utc::now().timestamp_millis()) {
        return error_response(&e);
    }

    Json(serde_json::json!({ "ok": true })).into_response()
}

fn error_response(e: &Error) -> Response {
    (
        axum::http::StatusCode::from_u16(e.http_status()).unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR),
        Json(ErrorBody::from(e)),
    )
        .into_response()
}
