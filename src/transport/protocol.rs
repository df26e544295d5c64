//! JSON frames exchanged with the backend.
//!
//! Every frame is an object tagged by `type`. Decoding is tolerant: an unknown
//! or malformed frame becomes a [`ProtocolError`] that the session records,
//! never a reason to drop the connection.

use crate::agent::Agent;
use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Frames sent by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Recognised user speech.
    Transcript { text: String },
    /// Reply from the active agent.
    AgentResponse { text: String },
    /// The backend routed the conversation to `new_agent`.
    AgentTransfer {
        #[serde(rename = "newAgent")]
        new_agent: Agent,
    },
    /// Backend-side failure, shown to the user.
    Error { message: String },
    /// The backend declined a requested hand-off.
    TransferRejected { agent: Agent, reason: String },
    /// Agent reply playback began.
    SpeechStarted,
    /// Agent reply playback ended.
    SpeechFinished,
}

const INBOUND_KINDS: &[&str] = &[
    "transcript",
    "agent_response",
    "agent_transfer",
    "error",
    "transfer_rejected",
    "speech_started",
    "speech_finished",
];

impl InboundFrame {
    /// Decode one frame, classifying the failure when it is not understood.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(s).map_err(|e| ProtocolError::Malformed {
                message: e.to_string(),
            })?;

        let kind = match value.get("type") {
            Some(serde_json::Value::String(kind)) => kind.clone(),
            Some(_) => {
                return Err(ProtocolError::Malformed {
                    message: "type tag is not a string".to_string(),
                });
            }
            None if value.is_object() => return Err(ProtocolError::MissingKind),
            None => {
                return Err(ProtocolError::Malformed {
                    message: "frame is not an object".to_string(),
                });
            }
        };

        if !INBOUND_KINDS.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownKind { kind });
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            kind,
            message: e.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Wire name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transcript { .. } => "transcript",
            Self::AgentResponse { .. } => "agent_response",
            Self::AgentTransfer { .. } => "agent_transfer",
            Self::Error { .. } => "error",
            Self::TransferRejected { .. } => "transfer_rejected",
            Self::SpeechStarted => "speech_started",
            Self::SpeechFinished => "speech_finished",
        }
    }
}

/// Frames sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Typed user message.
    Text { text: String },
    /// One audio segment of a listening turn, base64 PCM16LE.
    Audio {
        turn: u64,
        seq: u64,
        sample_rate: u32,
        data: String,
    },
    /// The user finished speaking; `chunks` segments were sent.
    EndOfTurn { turn: u64, chunks: u64 },
    /// The turn was cut short and should be discarded.
    TurnAborted { turn: u64 },
    TransferRequest { from: Agent, to: Agent },
}

impl OutboundFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Audio { .. } => "audio",
            Self::EndOfTurn { .. } => "end_of_turn",
            Self::TurnAborted { .. } => "turn_aborted",
            Self::TransferRequest { .. } => "transfer_request",
        }
    }
}
