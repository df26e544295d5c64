//! Session state machine data and its legality rules.

use crate::agent::Agent;
use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle.
///
/// `Disconnected → Connecting → Connected → {Disconnected, Error}`, with
/// `Error → Disconnected` on acknowledgement or once the retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What consumers see of the session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub connection_state: ConnectionState,
    pub active_agent: Agent,
    pub listening: bool,
    pub speaking: bool,
    pub last_transcript: Option<String>,
    pub last_reply: Option<String>,
    pub pending_transfer: Option<Agent>,
}

/// Mutable session fields. Only the session actor holds one.
#[derive(Debug, Clone)]
pub struct SessionState {
    connection: ConnectionState,
    active_agent: Agent,
    listening: bool,
    speaking: bool,
    last_transcript: Option<String>,
    last_reply: Option<String>,
    consecutive_failures: u32,
    retry_budget: u32,
}

impl SessionState {
    pub fn new(default_agent: Agent, retry_budget: u32) -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            active_agent: default_agent,
            listening: false,
            speaking: false,
            last_transcript: None,
            last_reply: None,
            consecutive_failures: 0,
            retry_budget,
        }
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn active_agent(&self) -> Agent {
        self.active_agent
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    fn invalid(&self, operation: &'static str) -> VoiceError {
        VoiceError::InvalidState {
            operation,
            state: self.describe(),
        }
    }

    fn describe(&self) -> String {
        match (self.connection, self.listening, self.speaking) {
            (ConnectionState::Connected, true, _) => "listening".to_string(),
            (ConnectionState::Connected, _, true) => "agent is speaking".to_string(),
            (state, _, _) => state.to_string(),
        }
    }

    pub fn check_connect(&self) -> Result<()> {
        match self.connection {
            ConnectionState::Disconnected | ConnectionState::Error => Ok(()),
            _ => Err(self.invalid("connect")),
        }
    }

    pub fn check_connected(&self, operation: &'static str) -> Result<()> {
        if self.connection == ConnectionState::Connected {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    /// Listening needs a connection and a silent agent.
    pub fn check_start_listening(&self) -> Result<()> {
        self.check_connected("start listening")?;
        if self.speaking {
            return Err(self.invalid("start listening"));
        }
        Ok(())
    }

    pub fn check_acknowledge(&self) -> Result<()> {
        match self.connection {
            ConnectionState::Error | ConnectionState::Disconnected => Ok(()),
            _ => Err(self.invalid("acknowledge error")),
        }
    }

    pub fn begin_connecting(&mut self) {
        self.connection = ConnectionState::Connecting;
    }

    /// Transport reported open. The active agent carries over from any
    /// earlier connection; only a confirmed transfer changes it.
    pub fn connected(&mut self) {
        self.connection = ConnectionState::Connected;
        self.consecutive_failures = 0;
        self.listening = false;
        self.speaking = false;
    }

    /// Enter `Error`. Returns true when the retry budget is exhausted and the
    /// machine fell back to `Disconnected`.
    pub fn connect_failed(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.enter_error();
        if self.retry_budget > 0 && self.consecutive_failures >= self.retry_budget {
            self.connection = ConnectionState::Disconnected;
            self.consecutive_failures = 0;
            return true;
        }
        false
    }

    /// An established connection was lost.
    pub fn connection_lost(&mut self) {
        self.enter_error();
    }

    fn enter_error(&mut self) {
        self.connection = ConnectionState::Error;
        self.listening = false;
        self.speaking = false;
    }

    pub fn acknowledge(&mut self) {
        if self.connection == ConnectionState::Error {
            self.connection = ConnectionState::Disconnected;
        }
    }

    pub fn disconnected(&mut self) {
        self.connection = ConnectionState::Disconnected;
        self.listening = false;
        self.speaking = false;
    }

    /// Only valid while connected and not speaking.
    pub fn set_listening(&mut self, listening: bool) {
        self.listening = listening && self.connection == ConnectionState::Connected;
    }

    /// Playback state. The caller ends any listening turn first.
    pub fn set_speaking(&mut self, speaking: bool) {
        self.speaking = speaking && self.connection == ConnectionState::Connected;
        if self.speaking {
            self.listening = false;
        }
    }

    pub fn set_active_agent(&mut self, agent: Agent) {
        self.active_agent = agent;
    }

    pub fn record_transcript(&mut self, text: &str) {
        self.last_transcript = Some(text.to_string());
    }

    pub fn record_reply(&mut self, text: &str) {
        self.last_reply = Some(text.to_string());
    }

    pub fn snapshot(&self, pending_transfer: Option<Agent>) -> SessionSnapshot {
        SessionSnapshot {
            connection_state: self.connection,
            active_agent: self.active_agent,
            listening: self.listening,
            speaking: self.speaking,
            last_transcript: self.last_transcript.clone(),
            last_reply: self.last_reply.clone(),
            pending_transfer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> SessionState {
        let mut state = SessionState::new(Agent::Triage, 3);
        state.begin_connecting();
        state.connected();
        state
    }

    #[test]
    fn test_initial_state() {
        let state = SessionState::new(Agent::Support, 3);
        assert_eq!(state.connection(), ConnectionState::Disconnected);
        assert_eq!(state.active_agent(), Agent::Support);
        assert!(!state.is_listening());
        assert!(!state.is_speaking());
    }

    #[test]
    fn test_connect_legal_only_from_disconnected_or_error() {
        let mut state = SessionState::new(Agent::Triage, 3);
        assert!(state.check_connect().is_ok());

        state.begin_connecting();
        assert!(state.check_connect().is_err());

        state.connected();
        assert!(matches!(
            state.check_connect(),
            Err(VoiceError::InvalidState {
                operation: "connect",
                ..
            })
        ));

        state.connection_lost();
        assert!(state.check_connect().is_ok());
    }

    #[test]
    fn test_listening_requires_connection() {
        let mut state = SessionState::new(Agent::Triage, 3);
        assert!(state.check_start_listening().is_err());
        state.set_listening(true);
        assert!(!state.is_listening());
    }

    #[test]
    fn test_listening_rejected_while_speaking() {
        let mut state = connected();
        state.set_speaking(true);
        let err = state.check_start_listening().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot start listening while agent is speaking"
        );
    }

    #[test]
    fn test_speaking_and_listening_never_both_true() {
        let mut state = connected();
        state.set_listening(true);
        state.set_speaking(true);
        assert!(state.is_speaking());
        assert!(!state.is_listening());
    }

    #[test]
    fn test_retry_budget_falls_back_to_disconnected() {
        let mut state = SessionState::new(Agent::Triage, 2);
        state.begin_connecting();
        assert!(!state.connect_failed());
        assert_eq!(state.connection(), ConnectionState::Error);

        state.begin_connecting();
        assert!(state.connect_failed());
        assert_eq!(state.connection(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut state = SessionState::new(Agent::Triage, 2);
        state.begin_connecting();
        state.connect_failed();
        state.begin_connecting();
        state.connected();
        state.disconnected();

        state.begin_connecting();
        assert!(!state.connect_failed());
    }

    #[test]
    fn test_acknowledge_moves_error_to_disconnected() {
        let mut state = connected();
        state.connection_lost();
        assert!(state.check_acknowledge().is_ok());
        state.acknowledge();
        assert_eq!(state.connection(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_acknowledge_rejected_while_connected() {
        let state = connected();
        assert!(state.check_acknowledge().is_err());
    }

    #[test]
    fn test_reconnect_keeps_active_agent() {
        let mut state = connected();
        state.set_active_agent(Agent::Billing);
        state.disconnected();
        state.begin_connecting();
        state.connected();
        assert_eq!(state.active_agent(), Agent::Billing);
    }

    #[test]
    fn test_snapshot_serializes_snake_case() {
        let mut state = connected();
        state.record_transcript("hello");
        let json = serde_json::to_value(state.snapshot(Some(Agent::Billing))).unwrap();
        assert_eq!(json["connection_state"], "connected");
        assert_eq!(json["active_agent"], "triage");
        assert_eq!(json["last_transcript"], "hello");
        assert_eq!(json["pending_transfer"], "billing");
    }
}
