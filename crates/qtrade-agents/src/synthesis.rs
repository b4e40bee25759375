//! Weighted vote reduction of tier results into a single decision.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use qtrade_models::agent_message::{ResultStatus, TierAggregate};
use qtrade_models::memory::{MemoryEffect, MemoryRecord, MemoryType};
use qtrade_models::runtime::RuntimeConfig;
use qtrade_models::score::Score;
use qtrade_models::trade_decision::{
    Action, ContributionTrace, Decision, DECISION_SCHEMA_VERSION, ORCHESTRATOR_AGENT,
};
use qtrade_models::trade_input::RunRequest;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use uuid::Uuid;

/// Number of supporting agents quoted in a decision's rationale.
const RATIONALE_SUPPORTERS: usize = 3;

/// Everything synthesis reads besides the tier results themselves.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisInputs<'a> {
    pub runtime: &'a RuntimeConfig,
    /// Vault excerpts for the symbol; active RISK_RULE blocks are honored.
    pub memories: &'a [MemoryRecord],
    pub min_valid_agents: usize,
    pub now: DateTime<Utc>,
}

/// Reduce every tier's outputs into one decision.
///
/// Each valid vote weighs `confidence * multiplier`. The multiplier is the
/// agent's configured weight, or zero when the voted action is blocked for
/// the symbol. The highest total wins; a tie at the top, or a top score of
/// zero, yields HOLD. Fewer than `min_valid_agents` valid results yields SKIP.
pub fn synthesize(
    request: &RunRequest,
    tiers: &[TierAggregate],
    inputs: SynthesisInputs<'_>,
) -> Decision {
    let blocked = blocked_actions(&request.symbol, inputs);
    let trace = build_trace(tiers, inputs.runtime, &blocked);

    let total_voters = trace.len();
    let valid: Vec<&ContributionTrace> = trace
        .iter()
        .filter(|t| t.status == ResultStatus::Ok && t.action.is_some())
        .collect();

    let mut scores: BTreeMap<Action, Decimal> = BTreeMap::new();
    for contribution in &valid {
        if let Some(action) = contribution.action {
            let score = scores.entry(action).or_default();
            *score = saturating_add(*score, contribution.weight);
        }
    }
    let denominator = valid.iter().fold(Decimal::ZERO, |sum, t| {
        saturating_add(sum, saturating_mul(Decimal::ONE_HUNDRED, t.multiplier))
    });

    let (action, confidence, rationale) = if valid.len() < inputs.min_valid_agents {
        (
            Action::Skip,
            Score::ZERO,
            format!(
                "Insufficient evidence: {} valid result(s) of {} agent(s), {} required",
                valid.len(),
                total_voters,
                inputs.min_valid_agents
            ),
        )
    } else {
        let (action, note) = pick_winner(&scores);
        let winner_score = scores.get(&action).copied().unwrap_or(Decimal::ZERO);
        let confidence = confidence_of(winner_score, denominator);
        let rationale = match note {
            Some(note) => note,
            None => rationale_for(action, &valid, tiers),
        };
        (action, confidence, rationale)
    };

    let mut factors = BTreeMap::new();
    factors.insert(
        "scores".to_string(),
        serde_json::json!(scores
            .iter()
            .map(|(action, score)| (action.as_str(), score.normalize().to_string()))
            .collect::<BTreeMap<_, _>>()),
    );
    factors.insert("valid_voters".to_string(), serde_json::json!(valid.len()));
    factors.insert("total_voters".to_string(), serde_json::json!(total_voters));
    factors.insert(
        "blocked".to_string(),
        serde_json::json!(blocked.iter().map(Action::as_str).collect::<Vec<_>>()),
    );

    Decision {
        id: Uuid::new_v4(),
        schema_version: DECISION_SCHEMA_VERSION,
        run_id: request.run_id,
        timestamp: inputs.now,
        agent: ORCHESTRATOR_AGENT.to_string(),
        tier: tiers.iter().map(|t| t.tier).max().unwrap_or(0),
        action,
        symbol: request.symbol.clone(),
        confidence,
        rationale,
        factors,
        trace,
    }
}

/// Actions forbidden for `symbol` by applied runtime blocks or active risk rules.
fn blocked_actions(symbol: &str, inputs: SynthesisInputs<'_>) -> BTreeSet<Action> {
    let mut blocked: BTreeSet<Action> = Action::ALL
        .into_iter()
        .filter(|action| inputs.runtime.is_blocked(symbol, *action))
        .collect();

    for memory in inputs.memories {
        if memory.memory_type != MemoryType::RiskRule
            || !memory.is_active_at(inputs.now)
            || !memory.related_symbols.contains(symbol)
        {
            continue;
        }
        if let Some(MemoryEffect::BlockAction { action }) = memory.effect {
            blocked.insert(action);
        }
    }
    blocked
}

fn build_trace(
    tiers: &[TierAggregate],
    runtime: &RuntimeConfig,
    blocked: &BTreeSet<Action>,
) -> Vec<ContributionTrace> {
    tiers
        .iter()
        .flat_map(|tier| tier.outputs.iter().map(move |output| (tier.tier, output)))
        .map(|(tier, output)| {
            let agent_id = output.analysis.agent_id.clone();
            match (&output.proposal, output.is_valid()) {
                (Some(proposal), true) => {
                    let multiplier = if blocked.contains(&proposal.action) {
                        Decimal::ZERO
                    } else {
                        runtime.agent_weight(&agent_id)
                    };
                    let confidence = output.analysis.confidence;
                    ContributionTrace {
                        tier,
                        agent_id,
                        status: ResultStatus::Ok,
                        action: Some(proposal.action),
                        confidence,
                        multiplier,
                        weight: saturating_mul(Decimal::from(confidence.value()), multiplier),
                    }
                }
                _ => ContributionTrace {
                    tier,
                    agent_id,
                    status: ResultStatus::Error,
                    action: None,
                    confidence: Score::ZERO,
                    multiplier: Decimal::ZERO,
                    weight: Decimal::ZERO,
                },
            }
        })
        .collect()
}

/// Winning action plus an explanatory note when the win is by default.
fn pick_winner(scores: &BTreeMap<Action, Decimal>) -> (Action, Option<String>) {
    let Some(top) = scores.values().copied().max() else {
        return (Action::Hold, Some("No votes were cast".to_string()));
    };
    if top.is_zero() {
        return (
            Action::Hold,
            Some("Every vote carried zero weight".to_string()),
        );
    }

    let leaders: Vec<Action> = scores
        .iter()
        .filter(|(_, score)| **score == top)
        .map(|(action, _)| *action)
        .collect();
    match leaders.as_slice() {
        [single] => (*single, None),
        tied => (
            Action::Hold,
            Some(format!(
                "No consensus: {} tied at {}",
                tied.iter().map(Action::as_str).collect::<Vec<_>>().join(", "),
                top.normalize()
            )),
        ),
    }
}

fn confidence_of(winner_score: Decimal, denominator: Decimal) -> Score {
    if denominator.is_zero() {
        return Score::ZERO;
    }
    let ratio = Decimal::ONE_HUNDRED
        .checked_mul(winner_score)
        .and_then(|scaled| scaled.checked_div(denominator))
        .or_else(|| {
            winner_score
                .checked_div(denominator)
                .and_then(|share| share.checked_mul(Decimal::ONE_HUNDRED))
        })
        .unwrap_or(Decimal::ZERO)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    Score::clamped(ratio.to_i64().unwrap_or(0))
}

fn saturating_mul(a: Decimal, b: Decimal) -> Decimal {
    a.checked_mul(b).unwrap_or(Decimal::MAX)
}

fn saturating_add(a: Decimal, b: Decimal) -> Decimal {
    a.checked_add(b).unwrap_or(Decimal::MAX)
}

fn rationale_for(action: Action, valid: &[&ContributionTrace], tiers: &[TierAggregate]) -> String {
    let reasons: HashMap<(u8, &str), &str> = tiers
        .iter()
        .flat_map(|tier| tier.outputs.iter().map(move |output| (tier.tier, output)))
        .filter_map(|(tier, output)| {
            output
                .proposal
                .as_ref()
                .map(|p| ((tier, output.analysis.agent_id.as_str()), p.rationale.as_str()))
        })
        .collect();

    let mut supporters: Vec<&&ContributionTrace> = valid
        .iter()
        .filter(|t| t.action == Some(action) && !t.weight.is_zero())
        .collect();
    supporters.sort_by(|a, b| {
        b.weight
            .cmp(&a.weight)
            .then_with(|| a.agent_id.cmp(&b.agent_id))
    });

    supporters
        .iter()
        .take(RATIONALE_SUPPORTERS)
        .map(|t| {
            let reason = reasons
                .get(&(t.tier, t.agent_id.as_str()))
                .copied()
                .unwrap_or_default();
            format!(
                "{} (tier {}, weight {}): {}",
                t.agent_id,
                t.tier,
                t.weight.normalize(),
                reason
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}
