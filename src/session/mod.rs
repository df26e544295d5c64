//! The voice session orchestrator and the state it owns.

pub mod log;
pub mod orchestrator;
pub mod router;
pub mod state;

pub use log::{ConversationEvent, EventKind, LogView, Projection};
pub use orchestrator::{SessionSettings, VoiceSession};
pub use router::TransferRequest;
pub use state::{ConnectionState, SessionSnapshot};
