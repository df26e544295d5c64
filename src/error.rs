//! Error types for medvoice.

use crate::agent::Agent;
use std::time::Duration;
use thiserror::Error;

/// Failure to bring a channel to the backend into the open state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("backend unreachable: {message}")]
    Unreachable { message: String },

    #[error("handshake rejected by backend (status {status})")]
    Rejected { status: u16 },

    #[error("invalid handshake: {message}")]
    Handshake { message: String },

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("cancelled by disconnect")]
    Cancelled,
}

/// A frame could not be delivered over the channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("channel is not open")]
    NotOpen,

    #[error("failed to encode frame: {message}")]
    Encode { message: String },

    #[error("transport write failed: {message}")]
    Transport { message: String },
}

/// An inbound frame could not be understood.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {message}")]
    Malformed { message: String },

    #[error("frame has no type tag")]
    MissingKind,

    #[error("unknown frame kind '{kind}'")]
    UnknownKind { kind: String },

    #[error("invalid '{kind}' frame: {message}")]
    InvalidPayload { kind: String, message: String },
}

#[derive(Error, Debug)]
pub enum VoiceError {
    // Session errors
    #[error("Connection failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("Send failed: {0}")]
    Send(#[from] SendError),

    #[error("Microphone unavailable: {message}")]
    Device { message: String },

    #[error("Transfer to {agent} agent rejected: {reason}")]
    TransferRejected { agent: Agent, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Voice session has shut down")]
    SessionClosed,

    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // IPC errors
    #[error("IPC socket error: {message}")]
    IpcSocket { message: String },

    #[error("IPC protocol error: {message}")]
    IpcProtocol { message: String },

    #[error("IPC connection failed: {message}")]
    IpcConnection { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl VoiceError {
    /// Shorthand for a [`VoiceError::Device`] with the given message.
    pub fn device(message: impl Into<String>) -> Self {
        VoiceError::Device {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
