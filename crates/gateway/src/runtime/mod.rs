//! Runtime: the pieces `AppState` wires together to run one turn —
//! provider resolution, tool dispatch (C9), the Approval Hub (C8), session
//! locking (C11), turn cancellation, and the turn orchestrator itself
//! (C10).

pub mod approval;
pub mod cancel;
pub mod provider;
pub mod session_lock;
pub mod sse;
pub mod tools;
pub mod turn;

pub use sse::{debounce, Record};
pub use turn::{run_turn, StreamMode, TurnEvent, TurnInput, EVENT_CHANNEL_CAPACITY};
