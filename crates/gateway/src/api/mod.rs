pub mod approvals;
pub mod artifacts;
pub mod auth;
pub mod chat;
pub mod sessions;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the HTTP surface (C13, §6): chat, session management,
/// tool-approval decisions, and artifact retrieval, all behind the bearer
/// token middleware.
pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/api/chat", post(chat::chat))
        .route("/api/sessions", post(sessions::create_session))
        .route("/api/sessions/:id/reset", post(sessions::reset_session))
        .route("/api/tool-approvals/:id", post(approvals::decide))
        .route("/api/artifacts", get(artifacts::get_artifact))
        .route_layer(middleware::from_fn_with_state(state, auth::require_api_token))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
