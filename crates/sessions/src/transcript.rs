//! Append-only transcript storage (C1 Transcript Model, §4.1, §6).
//!
//! Each session gets a `<sessionId>.jsonl` file under the transcript
//! directory; every `TranscriptRecord` is appended as one line. Reads are
//! idempotent on partial writes — a truncated trailing line is skipped
//! rather than failing the whole read.

use std::io::Write;
use std::path::{Path, PathBuf};

use sa_domain::error::{Error, Result};
use sa_domain::message::Message;
use sa_domain::trace::TraceEvent;
use sa_domain::transcript::{effective_messages, TranscriptRecord};

pub struct TranscriptStore {
    dir: PathBuf,
}

impl TranscriptStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(Error::Io)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }

    /// Append one record. Record ids must already be unique and timestamps
    /// non-decreasing — the caller (Turn Orchestrator) guarantees this under
    /// the Session Lock.
    pub fn append(&self, session_id: &str, record: &TranscriptRecord) -> Result<()> {
        let json = serde_json::to_string(record).map_err(Error::Json)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(session_id))
            .map_err(Error::Io)?;
        file.write_all(json.as_bytes()).map_err(Error::Io)?;
        file.write_all(b"\n").map_err(Error::Io)?;

        TraceEvent::TranscriptAppend {
            session_id: session_id.to_owned(),
            record_type: record_type_tag(record).to_owned(),
        }
        .emit();
        Ok(())
    }

    /// Read every raw record for a session, in append order.
    pub fn read_records(&self, session_id: &str) -> Result<Vec<TranscriptRecord>> {
        let path = self.path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let mut records = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptRecord>(line) {
                Ok(r) => records.push(r),
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "skipping malformed transcript line");
                }
            }
        }
        Ok(records)
    }

    /// Fold the raw record log into the effective message sequence (§4.1).
    pub fn effective_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(effective_messages(&self.read_records(session_id)?))
    }

    /// Append a `reset` record, truncating effective history without
    /// touching the raw record log (§9: retains raw records).
    pub fn reset(&self, session_id: &str, id: impl Into<String>, ts: i64) -> Result<()> {
        self.append(
            session_id,
            &TranscriptRecord::Reset {
                id: id.into(),
                ts,
                v: 1,
            },
        )
    }
}

fn record_type_tag(record: &TranscriptRecord) -> &'static str {
    match record {
        TranscriptRecord::Msg { .. } => "msg",
        TranscriptRecord::Reset { .. } => "reset",
        TranscriptRecord::Turn { .. } => "turn",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg_record(id: &str, ts: i64, msg: Message) -> TranscriptRecord {
        TranscriptRecord::Msg {
            id: id.into(),
            ts,
            v: 1,
            msg,
        }
    }

    #[test]
    fn append_and_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path()).unwrap();
        store
            .append("s1", &msg_record("1", 1, Message::user("hi")))
            .unwrap();
        store
            .append("s1", &msg_record("2", 2, Message::assistant("hello")))
            .unwrap();

        let records = store.read_records("s1").unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn effective_messages_honors_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path()).unwrap();
        store
            .append("s1", &msg_record("1", 1, Message::user("old")))
            .unwrap();
        store.reset("s1", "r1", 2).unwrap();
        store
            .append("s1", &msg_record("2", 3, Message::user("new")))
            .unwrap();

        let msgs = store.effective_messages("s1").unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text(), "new");
        // The raw log retains everything, including the dropped message.
        assert_eq!(store.read_records("s1").unwrap().len(), 3);
    }

    #[test]
    fn read_skips_malformed_trailing_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path()).unwrap();
        store
            .append("s1", &msg_record("1", 1, Message::user("hi")))
            .unwrap();
        let path = dir.path().join("s1.jsonl");
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(b"{not valid json\n").unwrap();

        let records = store.read_records("s1").unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn missing_session_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path()).unwrap();
        assert!(store.read_records("nope").unwrap().is_empty());
    }
}
