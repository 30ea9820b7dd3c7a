//! Shared application state (C13 HTTP Surface's handler context).
//!
//! One `AppState` is built at startup and cloned (cheaply — every field is
//! an `Arc`) into each axum handler.

use std::path::PathBuf;
use std::sync::Arc;

use sa_domain::config::Config;
use sa_providers::registry::ProviderRegistry;
use sa_sessions::{SessionStore, TranscriptStore};

use crate::runtime::approval::ApprovalStore;
use crate::runtime::cancel::CancelMap;
use crate::runtime::session_lock::SessionLockMap;
use crate::runtime::tools::ToolDispatcher;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub providers: Arc<ProviderRegistry>,
    pub sessions: Arc<SessionStore>,
    pub transcripts: Arc<TranscriptStore>,
    pub session_locks: Arc<SessionLockMap>,
    pub cancel_map: Arc<CancelMap>,
    pub approvals: Arc<ApprovalStore>,
    pub tools: Arc<ToolDispatcher>,
    /// SHA-256 of the configured bearer token. `None` means auth is
    /// disabled (dev mode — no token configured, §6).
    pub api_token_hash: Option<Vec<u8>>,
    /// `server.root`, resolved to an absolute path — artifacts, the
    /// session store, and the transcript directory all live under it.
    pub root: PathBuf,
}
