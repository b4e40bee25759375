use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use qtrade_models::agent_message::{AnalysisResult, PartialDecision};
use qtrade_models::memory::{MemoryEffect, MemoryRecord, MemoryType, Priority};
use qtrade_models::score::Score;
use qtrade_models::trade_decision::{Action, DecisionOutcome};
use qtrade_vault::MemoryVault;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::agent::{finding_str, Agent, AgentContext};
use crate::error::AgentError;

/// How long a risk rule recorded after a loss keeps blocking the action.
const DEFAULT_COOLDOWN_HOURS: i64 = 24;

/// Confidence when the gate holds because of a risk rule.
const RULE_HOLD_CONFIDENCE: i64 = 90;
/// Confidence when the gate holds because earlier tiers disagree.
const DISAGREEMENT_HOLD_CONFIDENCE: i64 = 70;
/// Confidence when there is nothing to review.
const NO_EVIDENCE_CONFIDENCE: i64 = 30;

/// Reviews earlier tiers against the symbol's risk rules.
///
/// Holds when a rule names the symbol or when earlier tiers disagree,
/// otherwise echoes the agreed action at three quarters of its confidence.
pub struct RiskGateAgent {
    id: String,
    /// Losses at or beyond this magnitude produce a RISK_RULE memory.
    loss_threshold: Decimal,
    cooldown: Duration,
}

impl RiskGateAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            loss_threshold: Decimal::ZERO,
            cooldown: Duration::hours(DEFAULT_COOLDOWN_HOURS),
        }
    }

    pub fn with_loss_threshold(mut self, threshold: Decimal) -> Self {
        self.loss_threshold = threshold.abs();
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[async_trait]
impl Agent for RiskGateAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn analyze(&self, context: &AgentContext) -> Result<AnalysisResult, AgentError> {
        let rules: Vec<String> = context.risk_rules().map(|r| r.title.clone()).collect();

        let mut tally: BTreeMap<Action, (usize, u64)> = BTreeMap::new();
        for (analysis, proposal) in context.prior_votes() {
            let entry = tally.entry(proposal.action).or_default();
            entry.0 += 1;
            entry.1 += u64::from(analysis.confidence.value());
        }

        let (verdict, action, confidence) = if !rules.is_empty() {
            ("risk_rule", Action::Hold, Score::clamped(RULE_HOLD_CONFIDENCE))
        } else if tally.len() > 1 {
            (
                "disagreement",
                Action::Hold,
                Score::clamped(DISAGREEMENT_HOLD_CONFIDENCE),
            )
        } else if let Some((action, (count, total))) = tally.iter().next() {
            let mean = *total / *count as u64;
            ("agreement", *action, Score::clamped((mean * 3 / 4) as i64))
        } else {
            ("no_evidence", Action::Hold, Score::clamped(NO_EVIDENCE_CONFIDENCE))
        };

        debug!(agent = %self.id, symbol = %context.symbol, verdict, rules = rules.len(), "Risk gate analyzed");
        Ok(AnalysisResult::new(&self.id, context.tier, confidence)
            .with_finding("verdict", serde_json::json!(verdict))
            .with_finding("action", serde_json::json!(action.as_str()))
            .with_finding("risk_rules", serde_json::json!(rules))
            .with_finding(
                "prior_votes",
                serde_json::json!(tally
                    .iter()
                    .map(|(action, (count, _))| (action.as_str(), *count))
                    .collect::<BTreeMap<_, _>>()),
            ))
    }

    async fn decide(&self, analysis: &AnalysisResult) -> Result<PartialDecision, AgentError> {
        let action: Action = finding_str(analysis, "action")?
            .parse()
            .map_err(AgentError::Parse)?;
        let rationale = match finding_str(analysis, "verdict")? {
            "risk_rule" => {
                let rules = analysis
                    .findings
                    .get("risk_rules")
                    .and_then(|v| v.as_array())
                    .map(|rules| {
                        rules
                            .iter()
                            .filter_map(|r| r.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                format!("Risk rule in force: {rules}")
            }
            "disagreement" => "Earlier tiers disagree".to_string(),
            "agreement" => format!("Earlier tiers agree on {action}"),
            _ => "No earlier votes to review".to_string(),
        };

        Ok(PartialDecision {
            action,
            confidence: analysis.confidence,
            rationale,
            factors: analysis.findings.clone(),
        })
    }

    /// A loss past the threshold blocks the same action on the symbol for a while.
    async fn learn(&self, outcome: &DecisionOutcome, vault: &MemoryVault) -> Result<(), AgentError> {
        if outcome.positive
            || outcome.action.is_conservative()
            || outcome.pnl > Decimal::ZERO
            || outcome.pnl.abs() < self.loss_threshold
        {
            return Ok(());
        }

        let now = Utc::now();
        let record = MemoryRecord::new(
            MemoryType::RiskRule,
            format!("Pause {} on {}", outcome.action, outcome.symbol),
            format!(
                "{} on {} lost {} (threshold {}); blocked for {}h",
                outcome.action,
                outcome.symbol,
                outcome.pnl.abs(),
                self.loss_threshold,
                self.cooldown.num_hours()
            ),
            &self.id,
        )
        .with_priority(Priority::High)
        .with_symbols([outcome.symbol.as_str()])
        .with_effect(MemoryEffect::BlockAction {
            action: outcome.action,
        })
        .with_validity(Some(now), Some(now + self.cooldown));

        let id = vault.store(record).await?;
        info!(agent = %self.id, memory = %id, symbol = %outcome.symbol, action = %outcome.action, "Recorded risk rule after loss");
        Ok(())
    }
}
