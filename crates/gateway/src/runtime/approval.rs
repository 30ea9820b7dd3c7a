//! Approval Hub — process-wide keyed registry gating risky tool calls
//! behind a human decision.
//!
//! `create` allocates an entry and an auto-expiry timer; the caller awaits
//! the returned receiver for the outcome. `decide` atomically transitions
//! a pending entry; transitions on a terminal entry are idempotent no-ops
//! so a late or duplicate decision can never panic or double-resolve the
//! waiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

/// The decision a human reviewer (or the expiry timer) reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Deny,
}

/// What a waiter on a pending approval ultimately receives.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalOutcome {
    pub decision: Decision,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum ApprovalState {
    Pending,
    Approved,
    Denied,
    Expired,
}

struct Entry {
    session_id: String,
    reason: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    state: ApprovalState,
    responder: Option<oneshot::Sender<ApprovalOutcome>>,
}

/// Serializable snapshot of a pending approval (dashboard / SSE use).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalInfo {
    pub id: Uuid,
    pub session_id: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval not found")]
    NotFound,
    #[error("approval belongs to a different session")]
    WrongSession,
}

impl From<ApprovalError> for sa_domain::error::Error {
    fn from(e: ApprovalError) -> Self {
        match e {
            ApprovalError::NotFound => sa_domain::error::Error::NotFound("approval".into()),
            ApprovalError::WrongSession => sa_domain::error::Error::WrongSession,
        }
    }
}

/// Process-wide registry of pending approvals.
pub struct ApprovalStore {
    entries: Arc<Mutex<HashMap<Uuid, Entry>>>,
    default_timeout: Duration,
}

impl ApprovalStore {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Allocate a fresh approval for `session_id`. Returns the id and a
    /// receiver that resolves once a decision is made or the entry expires.
    pub fn create(
        &self,
        session_id: impl Into<String>,
        reason: impl Into<String>,
        timeout_ms: Option<u64>,
    ) -> (Uuid, oneshot::Receiver<ApprovalOutcome>) {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let now = Utc::now();

        let entry = Entry {
            session_id: session_id.into(),
            reason: reason.into(),
            created_at: now,
            expires_at: now + chrono::Duration::from_std(timeout).unwrap_or_default(),
            state: ApprovalState::Pending,
            responder: Some(tx),
        };
        self.entries.lock().insert(id, entry);

        let entries = self.entries.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut guard = entries.lock();
            if let Some(entry) = guard.get_mut(&id) {
                if entry.state == ApprovalState::Pending {
                    entry.state = ApprovalState::Expired;
                    if let Some(responder) = entry.responder.take() {
                        let _ = responder.send(ApprovalOutcome {
                            decision: Decision::Deny,
                            timed_out: true,
                        });
                    }
                }
            }
        });

        (id, rx)
    }

    /// Resolve `id` with `decision`, scoped to `session_id`.
    ///
    /// Fails with `not_found`/`wrong_session`; a decision on an
    /// already-terminal entry is a silent no-op (idempotent).
    pub fn decide(
        &self,
        id: Uuid,
        session_id: &str,
        decision: Decision,
    ) -> Result<(), ApprovalError> {
        let mut guard = self.entries.lock();
        let entry = guard.get_mut(&id).ok_or(ApprovalError::NotFound)?;
        if entry.session_id != session_id {
            return Err(ApprovalError::WrongSession);
        }
        if entry.state != ApprovalState::Pending {
            return Ok(());
        }
        entry.state = match decision {
            Decision::Approve => ApprovalState::Approved,
            Decision::Deny => ApprovalState::Denied,
        };
        if let Some(responder) = entry.responder.take() {
            let _ = responder.send(ApprovalOutcome {
                decision,
                timed_out: false,
            });
        }
        Ok(())
    }

    /// List all approvals still awaiting a decision.
    pub fn list_pending(&self) -> Vec<ApprovalInfo> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, e)| e.state == ApprovalState::Pending)
            .map(|(id, e)| ApprovalInfo {
                id: *id,
                session_id: e.session_id.clone(),
                reason: e.reason.clone(),
                created_at: e.created_at,
                expires_at: e.expires_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> ApprovalStore {
        ApprovalStore::new(Duration::from_secs(300))
    }

    #[test]
    fn create_and_list() {
        let store = make_store();
        let (id, _rx) = store.create("sess1", "rm -rf /tmp", None);
        let list = store.list_pending();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, id);
        assert_eq!(list[0].session_id, "sess1");
    }

    #[tokio::test]
    async fn approve_resolves_waiter() {
        let store = make_store();
        let (id, rx) = store.create("sess1", "reason", None);
        store.decide(id, "sess1", Decision::Approve).unwrap();
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.decision, Decision::Approve);
        assert!(!outcome.timed_out);
        assert!(store.list_pending().is_empty());
    }

    #[tokio::test]
    async fn deny_resolves_waiter() {
        let store = make_store();
        let (id, rx) = store.create("sess1", "reason", None);
        store.decide(id, "sess1", Decision::Deny).unwrap();
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.decision, Decision::Deny);
    }

    #[test]
    fn decide_unknown_id_is_not_found() {
        let store = make_store();
        let err = store.decide(Uuid::new_v4(), "sess1", Decision::Approve);
        assert!(matches!(err, Err(ApprovalError::NotFound)));
    }

    #[test]
    fn decide_wrong_session_is_rejected() {
        let store = make_store();
        let (id, _rx) = store.create("sess1", "reason", None);
        let err = store.decide(id, "sess2", Decision::Approve);
        assert!(matches!(err, Err(ApprovalError::WrongSession)));
    }

    #[tokio::test]
    async fn duplicate_decision_is_idempotent() {
        let store = make_store();
        let (id, rx) = store.create("sess1", "reason", None);
        store.decide(id, "sess1", Decision::Approve).unwrap();
        // Second decision on an already-resolved entry is accepted but inert.
        store.decide(id, "sess1", Decision::Deny).unwrap();
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.decision, Decision::Approve);
    }

    #[tokio::test]
    async fn auto_expiry_denies_with_timed_out_flag() {
        let store = ApprovalStore::new(Duration::from_millis(20));
        let (_id, rx) = store.create("sess1", "reason", None);
        let outcome = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.decision, Decision::Deny);
        assert!(outcome.timed_out);
        assert!(store.list_pending().is_empty());
    }

    #[test]
    fn per_call_timeout_override() {
        let store = make_store();
        let (id, _rx) = store.create("sess1", "reason", Some(60_000));
        let list = store.list_pending();
        let entry = list.iter().find(|e| e.id == id).unwrap();
        let span = entry.expires_at - entry.created_at;
        assert!(span.num_seconds() >= 59 && span.num_seconds() <= 61);
    }
}
