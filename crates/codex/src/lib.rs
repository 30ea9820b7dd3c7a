//! Stdio JSON-RPC client (and limited server role) for a locally spawned
//! Codex app-server process, plus the turn protocol the gateway's provider
//! adapter runs on top of it.

mod protocol;
pub mod provider;
mod transport;
mod turn;

pub use protocol::{
    InboundMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    UNSUPPORTED_SERVER_REQUEST,
};
pub use provider::CodexProvider;
pub use transport::{
    CodexError, CodexResult, CodexTransport, DeclineApprovals, Notification, ServerRequestHandler,
};
pub use turn::{CodexClient, CodexTurnOutput, CodexTurnRequest};
