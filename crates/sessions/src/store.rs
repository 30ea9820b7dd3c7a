//! Gateway-owned session registry (§3 `Session`).
//!
//! Backed by a single `sessions.json` file under the configured state
//! directory. Sessions are created on first message and never garbage
//! collected automatically, per §3's lifecycle note.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use sa_domain::error::{Error, Result};
use sa_domain::trace::TraceEvent;
use sa_domain::transcript::{Session, SessionOrigin, SessionOriginKind};

pub struct SessionStore {
    path: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    /// Load (or create) the store at `<state_dir>/sessions.json`.
    pub fn new(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir).map_err(Error::Io)?;
        let path = state_dir.join("sessions.json");
        let sessions = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            sessions: RwLock::new(sessions),
        })
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Create the session if absent, or return the existing one. Returns
    /// `(session, is_new)`.
    pub fn ensure(&self, session_id: &str, origin: Option<SessionOrigin>) -> (Session, bool) {
        {
            let sessions = self.sessions.read();
            if let Some(existing) = sessions.get(session_id) {
                return (existing.clone(), false);
            }
        }

        let now = Utc::now();
        let session = Session {
            id: session_id.to_owned(),
            title: session_id.to_owned(),
            origin: origin.unwrap_or(SessionOrigin {
                kind: SessionOriginKind::Other,
                label: None,
            }),
            created_at: now,
            updated_at: now,
        };

        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(session_id.to_owned())
            .or_insert(session)
            .clone();
        drop(sessions);
        let _ = self.flush();

        TraceEvent::SessionResolved {
            session_id: session_id.to_owned(),
            is_new: true,
        }
        .emit();

        (session, true)
    }

    /// Bump `updated_at`, observable as the session's monotonic ordering
    /// marker for concurrent-request serializability (§8).
    pub fn touch(&self, session_id: &str) {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get_mut(session_id) {
            session.updated_at = Utc::now();
        }
        drop(sessions);
        let _ = self.flush();
    }

    pub fn list(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }

    fn flush(&self) -> Result<()> {
        let sessions = self.sessions.read();
        let json = serde_json::to_string_pretty(&*sessions)
            .map_err(|e| Error::Other(format!("serializing sessions: {e}")))?;
        std::fs::write(&self.path, json).map_err(Error::Io)
    }
}
