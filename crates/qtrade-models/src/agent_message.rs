use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::score::Score;
use crate::trade_decision::Action;

/// Lifecycle status of a registered agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Active,
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Ok,
    Error,
}

/// Output of an agent's `analyze` step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub agent_id: String,
    pub tier: u8,
    pub status: ResultStatus,
    /// Agent-specific structured findings.
    pub findings: BTreeMap<String, serde_json::Value>,
    pub confidence: Score,
    pub elapsed_ms: Option<u64>,
    pub error: Option<String>,
}

impl AnalysisResult {
    pub fn new(agent_id: impl Into<String>, tier: u8, confidence: Score) -> Self {
        Self {
            agent_id: agent_id.into(),
            tier,
            status: ResultStatus::Ok,
            findings: BTreeMap::new(),
            confidence,
            elapsed_ms: None,
            error: None,
        }
    }

    /// Degraded placeholder for an agent that errored, panicked or timed out.
    pub fn failed(agent_id: impl Into<String>, tier: u8, reason: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            tier,
            status: ResultStatus::Error,
            findings: BTreeMap::new(),
            confidence: Score::ZERO,
            elapsed_ms: None,
            error: Some(reason.into()),
        }
    }

    pub fn with_finding(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.findings.insert(key.into(), value);
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == ResultStatus::Error
    }
}

/// Output of an agent's `decide` step: one vote toward the final decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartialDecision {
    pub action: Action,
    pub confidence: Score,
    pub rationale: String,
    #[serde(default)]
    pub factors: BTreeMap<String, serde_json::Value>,
}

/// One agent's contribution to a tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentOutput {
    pub analysis: AnalysisResult,
    /// `None` when the agent failed before producing a vote.
    pub proposal: Option<PartialDecision>,
}

impl AgentOutput {
    pub fn failed(agent_id: impl Into<String>, tier: u8, reason: impl Into<String>) -> Self {
        Self {
            analysis: AnalysisResult::failed(agent_id, tier, reason),
            proposal: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.analysis.is_error() && self.proposal.is_some()
    }
}

/// The complete output of one tier, one entry per assigned agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierAggregate {
    pub tier: u8,
    pub outputs: Vec<AgentOutput>,
    pub elapsed_ms: u64,
}

impl TierAggregate {
    pub fn valid_count(&self) -> usize {
        self.outputs.iter().filter(|o| o.is_valid()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outputs.len() - self.valid_count()
    }

    pub fn all_failed(&self) -> bool {
        !self.outputs.is_empty() && self.valid_count() == 0
    }
}
