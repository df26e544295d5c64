//! Agent hand-off bookkeeping.
//!
//! At most one transfer is pending at a time. The backend's routing decision
//! always wins: a confirmation naming a different agent than requested is still
//! applied.

use crate::agent::Agent;
use crate::error::{Result, VoiceError};
use crate::session::state::ConnectionState;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// A hand-off waiting for the backend's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub from: Agent,
    pub to: Agent,
    pub requested_at: DateTime<Utc>,
}

/// How a confirming frame changed the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// `active_agent` moves from `from` to `to`. `requested` is the agent the
    /// client had asked for, if any.
    Applied {
        from: Agent,
        to: Agent,
        requested: Option<Agent>,
    },
    /// The confirmed agent is already active.
    Unchanged { requested: Option<Agent> },
}

#[derive(Debug)]
struct Pending {
    request: TransferRequest,
    deadline: Instant,
}

#[derive(Debug)]
pub struct AgentRouter {
    pending: Option<Pending>,
    timeout: Duration,
}

impl AgentRouter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: None,
            timeout,
        }
    }

    pub fn pending(&self) -> Option<&TransferRequest> {
        self.pending.as_ref().map(|p| &p.request)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// Validate and record a transfer request.
    pub fn request(
        &mut self,
        connection: ConnectionState,
        active: Agent,
        to: Agent,
    ) -> Result<TransferRequest> {
        if connection != ConnectionState::Connected {
            return Err(VoiceError::InvalidState {
                operation: "request transfer",
                state: connection.to_string(),
            });
        }
        if to == active {
            return Err(VoiceError::InvalidInput {
                message: format!("{} agent is already active", to),
            });
        }
        if let Some(pending) = &self.pending {
            return Err(VoiceError::InvalidState {
                operation: "request transfer",
                state: format!("transfer to {} agent pending", pending.request.to),
            });
        }

        let request = TransferRequest {
            from: active,
            to,
            requested_at: Utc::now(),
        };
        self.pending = Some(Pending {
            request: request.clone(),
            deadline: Instant::now() + self.timeout,
        });
        Ok(request)
    }

    /// The backend moved the conversation to `confirmed`.
    pub fn confirm(&mut self, active: Agent, confirmed: Agent) -> TransferOutcome {
        let requested = self.pending.take().map(|p| p.request.to);
        if confirmed == active {
            TransferOutcome::Unchanged { requested }
        } else {
            TransferOutcome::Applied {
                from: active,
                to: confirmed,
                requested,
            }
        }
    }

    /// The backend declined. Returns the request if `agent` matches it.
    pub fn reject(&mut self, agent: Agent) -> Option<TransferRequest> {
        if self.pending.as_ref().is_some_and(|p| p.request.to == agent) {
            return self.pending.take().map(|p| p.request);
        }
        None
    }

    /// Clear the pending request if its deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Option<TransferRequest> {
        if self.pending.as_ref().is_some_and(|p| now >= p.deadline) {
            return self.pending.take().map(|p| p.request);
        }
        None
    }

    /// Drop the pending request unconditionally.
    pub fn abandon(&mut self) -> Option<TransferRequest> {
        self.pending.take().map(|p| p.request)
    }
}
