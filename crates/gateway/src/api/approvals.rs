//! `POST /api/tool-approvals/:id` (C13, §4.8): a human's decision on a
//! pending tool call. The `ApprovalDecided` trace event fires once, from
//! inside the turn orchestrator when the approval's waiter resolves — this
//! handler only forwards the decision, it never emits that event itself.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use sa_domain::error::{Error, ErrorBody};

use crate::runtime::approval::Decision;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecideRequest {
    pub session_id: String,
    pub decision: Decision,
}

pub async fn decide(
    State(state): State<AppState>,
    Path(id): Path<uuid::Uuid>,
    Json(body): Json<DecideRequest>,
) -> Response {
    match state.approvals.decide(id, &body.session_id, body.decision) {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(e) => error_response(&Error::from(e)),
    }
}

fn error_response(e: &Error) -> Response {
    (
        axum::http::StatusCode::from_u16(e.http_status()).unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR),
        Json(ErrorBody::from(e)),
    )
        .into_response()
}
