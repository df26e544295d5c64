//! medvoice - Voice session orchestrator for a medical-office assistant
//!
//! One session per process: a websocket channel to the assistant backend,
//! push-to-talk audio capture, a conversation log, and agent routing between
//! triage, support and billing.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod agent;
pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
#[cfg(feature = "cpal-audio")]
pub mod daemon;
pub mod defaults;
pub mod error;
pub mod identity;
pub mod ipc;
pub mod logging;
#[cfg(feature = "cli")]
pub mod output;
pub mod session;
pub mod transport;

// Device and transport seams
pub use audio::recorder::{AudioSource, DeviceProvider};
pub use transport::{Channel, Connector};

// Session
pub use session::{
    ConnectionState, ConversationEvent, EventKind, SessionSettings, SessionSnapshot, VoiceSession,
};

// Domain types
pub use agent::Agent;
pub use identity::Credential;

// Error handling
pub use error::{Result, VoiceError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.0.1+abc1234"` when git hash is available, `"0.0.1"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
