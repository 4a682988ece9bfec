//! Named agents in the roster and their externally visible status.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ParseEnumError;

/// Role an agent plays in the delivery workflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentType {
    ProductOwner,
    TechLead,
    Developer,
    Qa,
    Reviewer,
    Devops,
}

impl AgentType {
    pub const ALL: [AgentType; 6] = [
        AgentType::ProductOwner,
        AgentType::TechLead,
        AgentType::Developer,
        AgentType::Qa,
        AgentType::Reviewer,
        AgentType::Devops,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentType::ProductOwner => "product-owner",
            AgentType::TechLead => "tech-lead",
            AgentType::Developer => "developer",
            AgentType::Qa => "qa",
            AgentType::Reviewer => "reviewer",
            AgentType::Devops => "devops",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("agent type", s))
    }
}

/// Status of an agent as recorded in the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Idle,
    Working,
    Paused,
    Blocked,
    Offline,
}

impl AgentStatus {
    pub const ALL: [AgentStatus; 5] = [
        AgentStatus::Idle,
        AgentStatus::Working,
        AgentStatus::Paused,
        AgentStatus::Blocked,
        AgentStatus::Offline,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Idle => "IDLE",
            AgentStatus::Working => "WORKING",
            AgentStatus::Paused => "PAUSED",
            AgentStatus::Blocked => "BLOCKED",
            AgentStatus::Offline => "OFFLINE",
        }
    }

    /// Whether the orchestrator may wake an agent in this status.
    pub fn is_available(self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Offline)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("agent status", s))
    }
}

/// A roster member and its live bookkeeping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub specialization: Option<String>,
    pub status: AgentStatus,
    pub current_task_id: Option<String>,
    pub working_on: Option<String>,
    pub blocker: Option<String>,
    pub pid: Option<u32>,
    pub session_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One roster line: the agent's unique name and its role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    #[serde(default)]
    pub specialization: Option<String>,
}

impl RosterEntry {
    pub fn new(name: &str, agent_type: AgentType) -> Self {
        Self {
            name: name.to_string(),
            agent_type,
            specialization: None,
        }
    }
}

/// The roster seeded into a fresh store when no roster is configured.
pub fn default_roster() -> Vec<RosterEntry> {
    vec![
        RosterEntry::new("product-owner", AgentType::ProductOwner),
        RosterEntry::new("tech-lead", AgentType::TechLead),
        RosterEntry::new("dev-alpha", AgentType::Developer),
        RosterEntry::new("dev-beta", AgentType::Developer),
        RosterEntry::new("dev-gamma", AgentType::Developer),
        RosterEntry::new("qa", AgentType::Qa),
        RosterEntry::new("reviewer", AgentType::Reviewer),
        RosterEntry::new("devops", AgentType::Devops),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_type_uses_kebab_case() {
        assert_eq!(
            serde_json::to_string(&AgentType::ProductOwner).unwrap(),
            "\"product-owner\""
        );
        assert_eq!("tech-lead".parse::<AgentType>().unwrap(), AgentType::TechLead);
    }

    #[test]
    fn only_idle_and_offline_are_available() {
        let available: Vec<_> = AgentStatus::ALL
            .into_iter()
            .filter(|s| s.is_available())
            .collect();
        assert_eq!(available, vec![AgentStatus::Idle, AgentStatus::Offline]);
    }

    #[test]
    fn default_roster_has_unique_names_and_three_developers() {
        let roster = default_roster();
        let mut names: Vec<_> = roster.iter().map(|r| r.name.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), roster.len());
        let devs = roster
            .iter()
            .filter(|r| r.agent_type == AgentType::Developer)
            .count();
        assert_eq!(devs, 3);
    }
}
