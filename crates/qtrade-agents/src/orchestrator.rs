use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use qtrade_models::agent_message::TierAggregate;
use qtrade_models::config::OrchestratorConfig;
use qtrade_models::memory::{MemoryQuery, MemoryRecord, MemoryType, OutcomeMark};
use qtrade_models::state::SystemState;
use qtrade_models::trade_decision::{Decision, DecisionOutcome, ORCHESTRATOR_AGENT};
use qtrade_models::trade_input::RunRequest;
use qtrade_vault::MemoryVault;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::AgentContext;
use crate::error::{OrchestratorError, TierError};
use crate::registry::AgentRegistry;
use crate::synthesis::{synthesize, SynthesisInputs};
use crate::tier::TierExecutor;

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "phase", content = "tier", rename_all = "snake_case")]
pub enum RunPhase {
    Pending,
    TierRunning(u8),
    TierSynthesizing(u8),
    FinalSynthesis,
    Decided,
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Pending => f.write_str("pending"),
            RunPhase::TierRunning(tier) => write!(f, "tier_running({tier})"),
            RunPhase::TierSynthesizing(tier) => write!(f, "tier_synthesizing({tier})"),
            RunPhase::FinalSynthesis => f.write_str("final_synthesis"),
            RunPhase::Decided => f.write_str("decided"),
            RunPhase::Failed => f.write_str("failed"),
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub decision: Decision,
    /// Every tier aggregate, in execution order.
    pub tiers: Vec<TierAggregate>,
    /// Every phase the run passed through.
    pub phases: Vec<RunPhase>,
    pub elapsed_ms: u64,
}

/// Drives agents tier by tier and synthesizes one decision per run.
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    vault: Arc<MemoryVault>,
    executor: TierExecutor,
    config: OrchestratorConfig,
}

struct PhaseLog {
    run_id: Uuid,
    phases: Vec<RunPhase>,
}

impl PhaseLog {
    fn enter(&mut self, phase: RunPhase) {
        info!(run_id = %self.run_id, phase = %phase, "Run phase");
        self.phases.push(phase);
    }
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        vault: Arc<MemoryVault>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            vault,
            executor: TierExecutor::from_config(&config),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn vault(&self) -> &Arc<MemoryVault> {
        &self.vault
    }

    /// Run every tier for `request.symbol` and persist the resulting decision.
    /// Top excerpts for `symbol`, plus every live risk rule for it. Risk
    /// rules bypass the excerpt limit so their blocks are always enforced.
    fn symbol_memories(&self, symbol: &str) -> Result<Vec<MemoryRecord>, OrchestratorError> {
        let mut memories = self.vault.retrieve(&MemoryQuery {
            limit: Some(self.config.memory_excerpt_limit),
            ..MemoryQuery::for_symbol(symbol)
        })?;
        let rules = self.vault.retrieve(&MemoryQuery {
            memory_type: Some(MemoryType::RiskRule),
            ..MemoryQuery::for_symbol(symbol)
        })?;
        let seen: HashSet<Uuid> = memories.iter().map(|m| m.id).collect();
        memories.extend(rules.into_iter().filter(|rule| !seen.contains(&rule.id)));
        Ok(memories)
    }

    pub async fn run(&self, mut request: RunRequest) -> Result<RunReport, OrchestratorError> {
        let start = Instant::now();
        // Vault records carry upper-cased symbols.
        request.symbol = request.symbol.trim().to_ascii_uppercase();
        if request.symbol.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "symbol is empty".to_string(),
            ));
        }
        let plan = self.registry.tier_plan();
        if plan.is_empty() {
            return Err(OrchestratorError::NoTiers);
        }

        let mut log = PhaseLog {
            run_id: request.run_id,
            phases: Vec::new(),
        };
        log.enter(RunPhase::Pending);
        info!(run_id = %request.run_id, symbol = %request.symbol, tiers = plan.len(), "Starting run");

        let memories = self.symbol_memories(&request.symbol)?;
        let runtime = self.vault.runtime_config()?;

        let mut history: Vec<TierAggregate> = Vec::with_capacity(plan.len());
        for (tier, agent_ids) in &plan {
            let tier = *tier;
            log.enter(RunPhase::TierRunning(tier));

            let context = Arc::new(AgentContext {
                run_id: request.run_id,
                symbol: request.symbol.clone(),
                tier,
                market: request.market.clone(),
                prior_tiers: history.clone(),
                memories: memories.clone(),
                runtime: runtime.clone(),
            });

            match self
                .executor
                .execute(&self.registry, tier, agent_ids, context)
                .await
            {
                Ok(aggregate) => {
                    log.enter(RunPhase::TierSynthesizing(tier));
                    history.push(aggregate);
                }
                Err(TierError::TotalFailure { tier, aggregate }) => {
                    let has_fallback = history.iter().any(|a| a.valid_count() > 0);
                    history.push(aggregate);
                    if self.config.fallback_on_total_failure && has_fallback {
                        warn!(run_id = %request.run_id, tier, "Tier failed completely, continuing with earlier results");
                        log.enter(RunPhase::TierSynthesizing(tier));
                        continue;
                    }
                    error!(run_id = %request.run_id, tier, "Tier failed completely, aborting run");
                    log.enter(RunPhase::Failed);
                    return Err(OrchestratorError::TierTotalFailure { tier, history });
                }
            }
        }

        log.enter(RunPhase::FinalSynthesis);
        let decision = synthesize(
            &request,
            &history,
            SynthesisInputs {
                runtime: &runtime,
                memories: &memories,
                min_valid_agents: self.config.min_valid_agents,
                now: Utc::now(),
            },
        );
        self.vault.record_decision(&decision)?;
        log.enter(RunPhase::Decided);

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            run_id = %request.run_id,
            symbol = %decision.symbol,
            action = %decision.action,
            confidence = decision.confidence.value(),
            elapsed_ms,
            "Run complete"
        );

        Ok(RunReport {
            decision,
            tiers: history,
            phases: log.phases,
            elapsed_ms,
        })
    }

    /// Most recent decisions, newest first.
    pub fn recent_decisions(&self, limit: usize) -> Result<Vec<Decision>, OrchestratorError> {
        Ok(self.vault.recent_decisions(limit)?)
    }

    /// Feed a realized outcome back to the agents that produced the decision
    /// and remember it as a TRADE_OUTCOME memory. Returns the memory id.
    pub async fn record_outcome(&self, outcome: DecisionOutcome) -> Result<Uuid, OrchestratorError> {
        let decision = self
            .vault
            .get_decision(outcome.decision_id)?
            .ok_or(OrchestratorError::UnknownDecision(outcome.decision_id))?;

        let agent_ids: BTreeSet<&str> = decision.trace.iter().map(|t| t.agent_id.as_str()).collect();
        for agent_id in agent_ids {
            let Some(agent) = self.registry.get(agent_id) else {
                warn!(agent = %agent_id, decision = %decision.id, "Agent from trace no longer registered");
                continue;
            };
            if !agent.capabilities().learn {
                continue;
            }
            if let Err(e) = agent.learn(&outcome, &self.vault).await {
                warn!(agent = %agent_id, decision = %decision.id, error = %e, "Agent learn failed");
            }
        }

        let record = MemoryRecord {
            outcome: Some(OutcomeMark {
                action: outcome.action,
                positive: outcome.positive,
            }),
            ..MemoryRecord::new(
                MemoryType::TradeOutcome,
                format!(
                    "{} {} {}",
                    outcome.action,
                    decision.symbol,
                    if outcome.positive { "win" } else { "loss" }
                ),
                format!(
                    "Decision {} closed with pnl {}{}",
                    decision.id,
                    outcome.pnl,
                    outcome
                        .exit_reason
                        .as_deref()
                        .map(|r| format!(" ({r})"))
                        .unwrap_or_default()
                ),
                ORCHESTRATOR_AGENT,
            )
            .with_symbols([decision.symbol.as_str()])
        };
        let id = self.vault.store(record).await?;

        info!(decision = %decision.id, memory = %id, positive = outcome.positive, "Outcome recorded");
        Ok(id)
    }

    /// Agent counts, vault health and decision count for the API layer.
    pub fn system_state(&self) -> Result<SystemState, OrchestratorError> {
        Ok(SystemState {
            timestamp: Utc::now(),
            agents: self.registry.counts(),
            memory_vault: self.vault.summary()?,
            decisions_recorded: self.vault.decision_count()?,
        })
    }
}
