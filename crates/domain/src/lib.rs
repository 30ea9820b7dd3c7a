pub mod config;
pub mod error;
pub mod message;
pub mod tokens;
pub mod tool;
pub mod trace;
pub mod transcript;

pub use config::Config;
pub use error::{Error, ErrorBody, Result};
pub use message::{ContentPart, Message, MessageContent};
pub use tool::{ToolCall, ToolDefinition, ToolResult};
pub use trace::TraceEvent;
pub use transcript::{effective_messages, is_valid_session_id, Session, SessionOrigin, SessionOriginKind, TranscriptRecord};
