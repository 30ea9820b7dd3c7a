//! Versioned append-only transcript records (C1, §3) and the `Session`
//! identity record. Pure in-memory logic only — the append-only file store
//! lives in `sa-sessions`.

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Versioned append-only record. Replay rule: fold left, honoring `reset`
/// (i.e. effective history starts after the latest `reset` record).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TranscriptRecord {
    Msg {
        id: String,
        ts: i64,
        #[serde(default = "default_version")]
        v: u32,
        msg: Message,
    },
    Reset {
        id: String,
        ts: i64,
        #[serde(default = "default_version")]
        v: u32,
    },
    Turn {
        id: String,
        ts: i64,
        #[serde(default = "default_version")]
        v: u32,
        token_budget: u64,
        used_tokens: u64,
        resolved_upstream: String,
        #[serde(default)]
        sampling_overrides: serde_json::Value,
    },
}

fn default_version() -> u32 {
    1
}

impl TranscriptRecord {
    pub fn id(&self) -> &str {
        match self {
            TranscriptRecord::Msg { id, .. } => id,
            TranscriptRecord::Reset { id, .. } => id,
            TranscriptRecord::Turn { id, .. } => id,
        }
    }

    pub fn ts(&self) -> i64 {
        match self {
            TranscriptRecord::Msg { ts, .. } => *ts,
            TranscriptRecord::Reset { ts, .. } => *ts,
            TranscriptRecord::Turn { ts, .. } => *ts,
        }
    }
}

/// Fold left over `records`, starting after the latest `reset`, yielding the
/// ordered sequence of effective messages. A `reset` record truncates the
/// effective history back to empty without touching the raw record log.
pub fn effective_messages(records: &[TranscriptRecord]) -> Vec<Message> {
    let start = records
        .iter()
        .rposition(|r| matches!(r, TranscriptRecord::Reset { .. }))
        .map(|idx| idx + 1)
        .unwrap_or(0);

    records[start..]
        .iter()
        .filter_map(|r| match r {
            TranscriptRecord::Msg { msg, .. } => Some(msg.clone()),
            _ => None,
        })
        .collect()
}

/// `(id, title, origin, createdAt, updatedAt)`. `id` matches
/// `^[A-Za-z0-9_-]{1,120}$`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub origin: SessionOrigin,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// An opaque tag used only for UI titling; program logic never branches on
/// `kind` beyond validating it is one of the known values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOrigin {
    pub kind: SessionOriginKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOriginKind {
    Discord,
    Telegram,
    Web,
    Other,
}

/// `^[A-Za-z0-9_-]{1,120}$`
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 120
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg_record(id: &str, ts: i64, text: &str) -> TranscriptRecord {
        TranscriptRecord::Msg {
            id: id.into(),
            ts,
            v: 1,
            msg: Message::user(text),
        }
    }

    #[test]
    fn effective_messages_without_reset_returns_all() {
        let records = vec![msg_record("1", 1, "a"), msg_record("2", 2, "b")];
        let msgs = effective_messages(&records);
        assert_eq!(msgs.len(), 2);
    }

    #[test]
    fn effective_messages_honors_latest_reset() {
        let records = vec![
            msg_record("1", 1, "a"),
            TranscriptRecord::Reset { id: "r1".into(), ts: 2, v: 1 },
            msg_record("2", 3, "b"),
            msg_record("3", 4, "c"),
        ];
        let msgs = effective_messages(&records);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].text(), "b");
    }

    #[test]
    fn effective_messages_uses_the_latest_of_multiple_resets() {
        let records = vec![
            msg_record("1", 1, "a"),
            TranscriptRecord::Reset { id: "r1".into(), ts: 2, v: 1 },
            msg_record("2", 3, "b"),
            TranscriptRecord::Reset { id: "r2".into(), ts: 4, v: 1 },
            msg_record("3", 5, "c"),
        ];
        let msgs = effective_messages(&records);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text(), "c");
    }

    #[test]
    fn session_id_validation() {
        assert!(is_valid_session_id("abc-123_XYZ"));
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("has space"));
        assert!(!is_valid_session_id(&"a".repeat(121)));
        assert!(is_valid_session_id(&"a".repeat(120)));
    }
}
