//! Test support: a scripted agent and context builders.
//!
//! `ScriptedAgent` returns a canned vote, optionally after a delay, or fails
//! or panics on demand. It records what it saw so tests can assert on the
//! context each tier received and on `learn` calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use qtrade_models::agent_message::{AgentOutput, AnalysisResult, PartialDecision, TierAggregate};
use qtrade_models::runtime::RuntimeConfig;
use qtrade_models::score::Score;
use qtrade_models::trade_decision::{Action, DecisionOutcome};
use qtrade_vault::MemoryVault;
use uuid::Uuid;

use crate::agent::{Agent, AgentContext};
use crate::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Vote,
    Fail,
    Panic,
}

pub struct ScriptedAgent {
    id: String,
    action: Action,
    confidence: Score,
    behavior: Behavior,
    delay: Option<Duration>,
    fail_learn: bool,
    calls: AtomicUsize,
    seen_prior_tiers: Mutex<Vec<usize>>,
    learned: Mutex<Vec<DecisionOutcome>>,
}

impl ScriptedAgent {
    fn with_behavior(id: &str, action: Action, confidence: u8, behavior: Behavior) -> Self {
        Self {
            id: id.to_string(),
            action,
            confidence: Score::clamped(i64::from(confidence)),
            behavior,
            delay: None,
            fail_learn: false,
            calls: AtomicUsize::new(0),
            seen_prior_tiers: Mutex::new(Vec::new()),
            learned: Mutex::new(Vec::new()),
        }
    }

    /// Always votes `action` with `confidence`.
    pub fn voting(id: &str, action: Action, confidence: u8) -> Self {
        Self::with_behavior(id, action, confidence, Behavior::Vote)
    }

    /// `analyze` always returns an error.
    pub fn failing(id: &str) -> Self {
        Self::with_behavior(id, Action::Hold, 0, Behavior::Fail)
    }

    /// `analyze` always panics.
    pub fn panicking(id: &str) -> Self {
        Self::with_behavior(id, Action::Hold, 0, Behavior::Panic)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_learn_failure(mut self) -> Self {
        self.fail_learn = true;
        self
    }

    /// Number of `analyze` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of prior tiers visible in each context this agent received.
    pub fn seen_prior_tiers(&self) -> Vec<usize> {
        self.seen_prior_tiers
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }

    /// Outcomes passed to `learn`, in call order.
    pub fn learned(&self) -> Vec<DecisionOutcome> {
        self.learned
            .lock()
            .map(|learned| learned.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn analyze(&self, context: &AgentContext) -> Result<AnalysisResult, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen_prior_tiers.lock() {
            seen.push(context.prior_tiers.len());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.behavior {
            Behavior::Vote => Ok(AnalysisResult::new(&self.id, context.tier, self.confidence)
                .with_finding("scripted", serde_json::json!(true))),
            Behavior::Fail => Err(AgentError::Execution(format!("{} scripted failure", self.id))),
            Behavior::Panic => panic!("{} scripted panic", self.id),
        }
    }

    async fn decide(&self, analysis: &AnalysisResult) -> Result<PartialDecision, AgentError> {
        Ok(PartialDecision {
            action: self.action,
            confidence: analysis.confidence,
            rationale: format!("{} scripted {}", self.id, self.action),
            factors: Default::default(),
        })
    }

    async fn learn(&self, outcome: &DecisionOutcome, _vault: &MemoryVault) -> Result<(), AgentError> {
        if let Ok(mut learned) = self.learned.lock() {
            learned.push(outcome.clone());
        }
        if self.fail_learn {
            return Err(AgentError::Execution(format!("{} scripted learn failure", self.id)));
        }
        Ok(())
    }
}

/// Empty context for `symbol` at `tier`.
pub fn context_for(symbol: &str, tier: u8) -> AgentContext {
    AgentContext {
        run_id: Uuid::new_v4(),
        symbol: symbol.to_string(),
        tier,
        market: serde_json::json!({}),
        prior_tiers: vec![],
        memories: vec![],
        runtime: RuntimeConfig::default(),
    }
}

/// Tier-1 context carrying `market`.
pub fn context_with_market(symbol: &str, market: serde_json::Value) -> AgentContext {
    AgentContext {
        market,
        ..context_for(symbol, 1)
    }
}

/// Tier-2 context whose single prior tier holds the given `(agent, action, confidence)` votes.
pub fn context_with_prior_votes(symbol: &str, votes: &[(&str, Action, u8)]) -> AgentContext {
    let outputs = votes
        .iter()
        .map(|(agent, action, confidence)| {
            let confidence = Score::clamped(i64::from(*confidence));
            AgentOutput {
                analysis: AnalysisResult::new(*agent, 1, confidence),
                proposal: Some(PartialDecision {
                    action: *action,
                    confidence,
                    rationale: format!("{agent} votes {action}"),
                    factors: Default::default(),
                }),
            }
        })
        .collect();

    AgentContext {
        prior_tiers: vec![TierAggregate {
            tier: 1,
            outputs,
            elapsed_ms: 0,
        }],
        ..context_for(symbol, 2)
    }
}

/// `count` closes rising by 1.0 from `start`.
pub fn rising_closes(start: f64, count: usize) -> serde_json::Value {
    serde_json::json!((0..count).map(|i| start + i as f64).collect::<Vec<_>>())
}

/// `count` closes falling by 1.0 from `start`.
pub fn falling_closes(start: f64, count: usize) -> serde_json::Value {
    serde_json::json!((0..count).map(|i| start - i as f64).collect::<Vec<_>>())
}
