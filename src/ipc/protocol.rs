//! JSON message protocol for IPC communication between CLI and daemon.

use crate::agent::Agent;
use crate::session::log::ConversationEvent;
use crate::session::state::SessionSnapshot;
use serde::{Deserialize, Serialize};

/// Commands sent by CLI to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Connect to the backend with a bearer token
    Connect { token: String },
    /// Disconnect and release everything
    Disconnect,
    /// Clear the error state
    AcknowledgeError,
    /// Start a listening turn
    StartListening,
    /// Finish the listening turn
    StopListening,
    /// Send a typed message
    SendText { text: String },
    /// Ask for a hand-off to another agent
    Transfer { agent: Agent },
    /// Get session status
    Status,
    /// Conversation entries after `since`
    History {
        #[serde(default)]
        since: u64,
    },
    /// Stream conversation entries after `since` until the client hangs up
    Follow {
        #[serde(default)]
        since: u64,
    },
    /// Shutdown the daemon
    Shutdown,
}

impl Command {
    /// Serialize command to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize command from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Responses sent by daemon to CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Command succeeded
    Ok,
    /// Transfer confirmed; `agent` is where the backend routed the conversation
    Transferred { agent: Agent },
    /// Current session status
    Status {
        session: SessionSnapshot,
        endpoint: String,
        device: String,
        log_entries: u64,
    },
    /// Conversation entries
    History { events: Vec<ConversationEvent> },
    /// One streamed conversation entry (follow mode)
    Event { event: ConversationEvent },
    /// Error occurred
    Error { message: String },
}

impl Response {
    /// Serialize response to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize response from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::log::EventKind;
    use crate::session::state::ConnectionState;
    use chrono::Utc;

    #[test]
    fn test_command_all_variants_serialize() {
        let commands = vec![
            Command::Connect {
                token: "abc".to_string(),
            },
            Command::Disconnect,
            Command::AcknowledgeError,
            Command::StartListening,
            Command::StopListening,
            Command::SendText {
                text: "hello".to_string(),
            },
            Command::Transfer {
                agent: Agent::Billing,
            },
            Command::Status,
            Command::History { since: 3 },
            Command::Follow { since: 0 },
            Command::Shutdown,
        ];

        for cmd in commands {
            let json = cmd.to_json().expect("should serialize");
            let deserialized = Command::from_json(&json).expect("should deserialize");
            assert_eq!(cmd, deserialized, "roundtrip failed for {:?}", cmd);
        }
    }

    #[test]
    fn test_command_json_format_examples() {
        assert_eq!(
            Command::StartListening.to_json().unwrap(),
            r#"{"type":"start_listening"}"#
        );
        assert_eq!(
            Command::Transfer {
                agent: Agent::Support
            }
            .to_json()
            .unwrap(),
            r#"{"type":"transfer","agent":"support"}"#
        );
        assert_eq!(
            Command::SendText {
                text: "hi".to_string()
            }
            .to_json()
            .unwrap(),
            r#"{"type":"send_text","text":"hi"}"#
        );
    }

    #[test]
    fn test_history_since_defaults_to_zero() {
        let cmd = Command::from_json(r#"{"type":"history"}"#).unwrap();
        assert_eq!(cmd, Command::History { since: 0 });
        let cmd = Command::from_json(r#"{"type":"follow"}"#).unwrap();
        assert_eq!(cmd, Command::Follow { since: 0 });
    }

    #[test]
    fn test_invalid_json_returns_error() {
        assert!(Command::from_json(r#"{"type": "toggle"}"#).is_err());
        assert!(Command::from_json(r#"{"invalid": "json"}"#).is_err());
        assert!(Command::from_json("not json at all").is_err());
        assert!(Command::from_json(r#"{"type":"transfer","agent":"radiology"}"#).is_err());
    }

    #[test]
    fn test_response_status_shape() {
        let resp = Response::Status {
            session: SessionSnapshot {
                connection_state: ConnectionState::Connected,
                listening: true,
                ..SessionSnapshot::default()
            },
            endpoint: "ws://localhost/voice".to_string(),
            device: "default".to_string(),
            log_entries: 4,
        };
        let json = resp.to_json().expect("should serialize");
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains(r#""connection_state":"connected""#));
        assert!(json.contains(r#""listening":true"#));
        assert_eq!(Response::from_json(&json).unwrap(), resp);
    }

    #[test]
    fn test_response_event_roundtrip() {
        let resp = Response::Event {
            event: ConversationEvent {
                id: 7,
                kind: EventKind::AgentReply,
                text: r#"Say "ahh" \n please"#.to_string(),
                timestamp: Utc::now(),
                agent: Agent::Support,
            },
        };
        let json = resp.to_json().unwrap();
        assert!(json.contains(r#""kind":"agent_reply""#));
        assert_eq!(Response::from_json(&json).unwrap(), resp);
    }

    #[test]
    fn test_response_json_format_examples() {
        assert_eq!(Response::Ok.to_json().unwrap(), r#"{"type":"ok"}"#);
        assert_eq!(
            Response::Transferred {
                agent: Agent::Billing
            }
            .to_json()
            .unwrap(),
            r#"{"type":"transferred","agent":"billing"}"#
        );
        let error = Response::Error {
            message: "test error".to_string(),
        }
        .to_json()
        .unwrap();
        assert!(error.contains(r#""type":"error""#));
        assert!(error.contains(r#""message":"test error""#));
    }
}
