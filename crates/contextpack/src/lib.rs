//! Context Builder (C7): truncates a message history to a token budget while
//! preserving ordering invariants — the most recent user message, the system
//! prompt, and every assistant/tool-result round are kept intact or dropped
//! whole, never split.

pub mod builder;

pub use builder::{build, ContextResult};
