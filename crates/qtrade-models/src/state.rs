use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent_message::AgentStatus;
use crate::score::Score;

/// Registered agents grouped by status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentCounts {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub ready: usize,
    pub error: usize,
}

impl AgentCounts {
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = AgentStatus>,
    {
        let mut counts = AgentCounts::default();
        for status in statuses {
            counts.total += 1;
            match status {
                AgentStatus::Idle => counts.idle += 1,
                AgentStatus::Active => counts.active += 1,
                AgentStatus::Ready => counts.ready += 1,
                AgentStatus::Error => counts.error += 1,
            }
        }
        counts
    }
}

/// Memory vault health figures.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultSummary {
    pub total: usize,
    /// Records not yet applied.
    pub pending: usize,
    pub applied: usize,
    /// Mean effectiveness of recently created, scored records.
    pub intelligence_score: Score,
}

/// Summary consumed by the external API layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemState {
    pub timestamp: DateTime<Utc>,
    pub agents: AgentCounts,
    pub memory_vault: VaultSummary,
    pub decisions_recorded: usize,
}
