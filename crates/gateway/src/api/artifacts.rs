//! `GET /api/artifacts?path=...` (C13, §4.9): serves files externalized by
//! the Tool Dispatcher's `exec` output handling, rooted at
//! `<server.root>/.eclia/artifacts/`.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use sa_domain::error::{Error, ErrorBody};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ArtifactQuery {
    path: String,
}

pub async fn get_artifact(State(state): State<AppState>, Query(query): Query<ArtifactQuery>) -> Response {
    let artifacts_root = state.root.join(".eclia").join("artifacts");

    let requested = std::path::Path::new(&query.path);
    if requested.is_absolute() || requested.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return error_response(&Error::BadRequest("path must be a relative path with no '..' segments".into()));
    }

    let full_path = artifacts_root.join(requested);
    let canonical = match full_path.canonicalize() {
        Ok(p) => p,
        Err(_) => return error_response(&Error::NotFound(query.path)),
    };
    let canonical_root = match artifacts_root.canonicalize() {
        Ok(p) => p,
        Err(_) => return error_response(&Error::NotFound(query.path)),
    };
    if !canonical.starts_with(&canonical_root) {
        return error_response(&Error::BadRequest("path escapes the artifacts directory".into()));
    }

    match tokio::fs::read(&canonical).await {
        Ok(bytes) => ([("content-type", "text/plain; charset=utf-8")], bytes).into_response(),
        Err(_) => error_response(&Error::NotFound(query.path)),
    }
}

fn error_response(e: &Error) -> Response {
    (
        axum::http::StatusCode::from_u16(e.http_status()).unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR),
        axum::Json(ErrorBody::from(e)),
    )
        .into_response()
}
