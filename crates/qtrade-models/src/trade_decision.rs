use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent_message::ResultStatus;
use crate::score::Score;

pub const DECISION_SCHEMA_VERSION: u32 = 1;

/// Name recorded as the originating agent of synthesized decisions.
pub const ORCHESTRATOR_AGENT: &str = "orchestrator";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
    Skip,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::Buy, Action::Sell, Action::Hold, Action::Skip];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
            Action::Hold => "HOLD",
            Action::Skip => "SKIP",
        }
    }

    /// HOLD and SKIP never open or close a position.
    pub fn is_conservative(&self) -> bool {
        matches!(self, Action::Hold | Action::Skip)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(Action::Buy),
            "SELL" => Ok(Action::Sell),
            "HOLD" => Ok(Action::Hold),
            "SKIP" => Ok(Action::Skip),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

/// The immutable audit record produced by one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub id: Uuid,
    pub schema_version: u32,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Originating agent, `"orchestrator"` for synthesized decisions.
    pub agent: String,
    /// Last tier that contributed to the decision.
    pub tier: u8,
    pub action: Action,
    pub symbol: String,
    pub confidence: Score,
    pub rationale: String,
    pub factors: BTreeMap<String, serde_json::Value>,
    /// Every tier result considered during synthesis.
    pub trace: Vec<ContributionTrace>,
}

impl Decision {
    /// Distinct agent ids that contributed a valid vote.
    pub fn contributing_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self
            .trace
            .iter()
            .filter(|t| t.status == ResultStatus::Ok)
            .map(|t| t.agent_id.clone())
            .collect();
        agents.sort();
        agents.dedup();
        agents
    }
}

/// How a single tier result fed into synthesis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContributionTrace {
    pub tier: u8,
    pub agent_id: String,
    pub status: ResultStatus,
    /// The action voted for, `None` for failed agents.
    pub action: Option<Action>,
    pub confidence: Score,
    pub multiplier: Decimal,
    /// `confidence * multiplier`, the vote's final weight.
    pub weight: Decimal,
}

/// Realized result of acting on a decision, fed back into `learn()`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionOutcome {
    pub decision_id: Uuid,
    pub symbol: String,
    pub action: Action,
    pub pnl: Decimal,
    pub positive: bool,
    pub exit_reason: Option<String>,
    pub observed_at: DateTime<Utc>,
}
