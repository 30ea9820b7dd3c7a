//! Session and transcript persistence (C1 Transcript Model, §3, §4.1).
//!
//! `SessionStore` tracks session identity/metadata; `TranscriptStore` owns
//! the append-only per-session record log and replays it into effective
//! messages. Mutation of either is serialized by the gateway's Session Lock
//! (§4.11) — neither type takes its own lock wider than a single file op.

pub mod store;
pub mod transcript;

pub use store::SessionStore;
pub use transcript::TranscriptStore;
