//! The specialized agents a conversation can be routed to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A specialized backend agent.
///
/// The set is closed: routing decisions and wire frames only ever carry one of
/// these values. Unknown agent names coming from the backend are protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agent {
    /// Initial patient intake and routing
    #[default]
    Triage,
    /// Medical services and appointments
    Support,
    /// Insurance and payment inquiries
    Billing,
}

/// Display metadata for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentInfo {
    pub name: &'static str,
    pub description: &'static str,
}

impl Agent {
    pub const ALL: [Agent; 3] = [Agent::Triage, Agent::Support, Agent::Billing];

    /// Wire and config identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Agent::Triage => "triage",
            Agent::Support => "support",
            Agent::Billing => "billing",
        }
    }

    pub fn info(&self) -> AgentInfo {
        match self {
            Agent::Triage => AgentInfo {
                name: "Triage Agent",
                description: "Initial patient intake and routing",
            },
            Agent::Support => AgentInfo {
                name: "Support Agent",
                description: "Medical services and appointments",
            },
            Agent::Billing => AgentInfo {
                name: "Billing Agent",
                description: "Insurance and payment inquiries",
            },
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Agent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Agent::ALL
            .into_iter()
            .find(|agent| agent.as_str() == lower)
            .ok_or_else(|| {
                format!(
                    "unknown agent '{}' (expected one of: triage, support, billing)",
                    s
                )
            })
    }
}
