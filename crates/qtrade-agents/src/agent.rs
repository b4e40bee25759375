use async_trait::async_trait;
use chrono::Utc;
use qtrade_models::agent_message::{AnalysisResult, PartialDecision, TierAggregate};
use qtrade_models::memory::{MemoryRecord, MemoryType};
use qtrade_models::runtime::RuntimeConfig;
use qtrade_models::trade_decision::DecisionOutcome;
use qtrade_vault::MemoryVault;
use serde::Serialize;
use uuid::Uuid;

use crate::error::AgentError;

/// Which lifecycle steps an agent implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub analyze: bool,
    pub decide: bool,
    pub learn: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            analyze: true,
            decide: true,
            learn: true,
        }
    }
}

/// Read-only view handed to every agent of a tier.
///
/// Built once per tier and shared behind an `Arc`; agents never mutate it.
#[derive(Debug, Clone, Serialize)]
pub struct AgentContext {
    pub run_id: Uuid,
    pub symbol: String,
    pub tier: u8,
    pub market: serde_json::Value,
    /// Aggregates of every tier that already ran, oldest first.
    pub prior_tiers: Vec<TierAggregate>,
    /// Vault excerpts relevant to the symbol.
    pub memories: Vec<MemoryRecord>,
    pub runtime: RuntimeConfig,
}

impl AgentContext {
    /// Valid votes from earlier tiers as `(analysis, proposal)` pairs.
    pub fn prior_votes(&self) -> impl Iterator<Item = (&AnalysisResult, &PartialDecision)> {
        self.prior_tiers
            .iter()
            .flat_map(|tier| tier.outputs.iter())
            .filter(|output| output.is_valid())
            .filter_map(|output| output.proposal.as_ref().map(|p| (&output.analysis, p)))
    }

    /// Active RISK_RULE excerpts naming this run's symbol.
    pub fn risk_rules(&self) -> impl Iterator<Item = &MemoryRecord> {
        let now = Utc::now();
        self.memories.iter().filter(move |m| {
            m.memory_type == MemoryType::RiskRule
                && m.is_active_at(now)
                && m.related_symbols.contains(&self.symbol)
        })
    }
}

/// Trait for tier agents. Mockable for testing.
///
/// Agents keep no state between calls; anything they learn is persisted as a
/// `MemoryRecord` through the vault.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn analyze(&self, context: &AgentContext) -> Result<AnalysisResult, AgentError>;

    async fn decide(&self, analysis: &AnalysisResult) -> Result<PartialDecision, AgentError>;

    async fn learn(
        &self,
        _outcome: &DecisionOutcome,
        _vault: &MemoryVault,
    ) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Read a string finding written by `analyze`.
pub(crate) fn finding_str<'a>(
    analysis: &'a AnalysisResult,
    key: &str,
) -> Result<&'a str, AgentError> {
    analysis
        .findings
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| AgentError::Parse(format!("missing finding: {key}")))
}
