//! `POST /api/chat` (C13, §6): the one entry point into the turn
//! orchestrator. Always responds as an SSE stream — even a single-shot
//! client just reads the whole stream and keeps the `final` event.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;

use sa_domain::error::{Error, ErrorBody};
use sa_domain::transcript::{is_valid_session_id, SessionOrigin, SessionOriginKind};

use crate::runtime::{debounce, run_turn, StreamMode, TurnInput, EVENT_CHANNEL_CAPACITY};
use crate::runtime::tools::ToolAccessMode;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub session_id: String,
    pub user_text: String,
    #[serde(default)]
    pub route_key: Option<String>,
    #[serde(default)]
    pub tool_access_mode: ToolAccessMode,
    #[serde(default)]
    pub stream_mode: StreamMode,
}

pub async fn chat(State(state): State<AppState>, Json(body): Json<ChatRequest>) -> Response {
    if !is_valid_session_id(&body.session_id) {
        let err = Error::InvalidSessionId;
        return error_response(&err);
    }
    if body.user_text.trim().is_empty() {
        let err = Error::BadRequest("userText must not be empty".into());
        return error_response(&err);
    }

    state.sessions.ensure(
        &body.session_id,
        Some(SessionOrigin {
            kind: SessionOriginKind::Web,
            label: None,
        }),
    );

    let input = TurnInput {
        session_id: body.session_id.clone(),
        user_text: body.user_text,
        route_key: body.route_key,
        tool_access_mode: body.tool_access_mode,
        stream_mode: body.stream_mode,
    };

    let (tx, rx) = tokio::sync::mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let session_id = input.session_id.clone();

    tokio::spawn(async move {
        state
            .session_locks
            .with_lock(&session_id, || run_turn(&state, input, tx))
            .await;
    });

    Sse::new(sse_stream(rx)).keep_alive(KeepAlive::default()).into_response()
}

fn sse_stream(
    rx: tokio::sync::mpsc::Receiver<crate::runtime::TurnEvent>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        let mut records = std::pin::pin!(debounce(rx));
        while let Some(record) = records.next().await {
            let name = record.event_name();
            let data = serde_json::to_string(&record).unwrap_or_default();
            yield Ok(Event::default().event(name).data(data));
        }
    }
}

fn error_response(e: &Error) -> Response {
    (
        axum::http::StatusCode::from_u16(e.http_status()).unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR),
        Json(ErrorBody::from(e)),
    )
        .into_response()
}
