//! End-to-end runs through the orchestrator.
//!
//! Each test registers scripted or built-in agents against an in-memory
//! vault, runs one or more tiers and checks the synthesized decision, the
//! tier history and what was persisted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use qtrade_agents::test_support::{rising_closes, ScriptedAgent};
use qtrade_agents::{
    Agent, AgentRegistry, Orchestrator, OrchestratorError, RiskGateAgent, RunPhase, TrendAgent,
};
use qtrade_models::config::OrchestratorConfig;
use qtrade_models::memory::{MemoryEffect, MemoryQuery, MemoryRecord, MemoryType, Priority};
use qtrade_models::trade_decision::{Action, DecisionOutcome};
use qtrade_models::trade_input::RunRequest;
use qtrade_vault::{MemoryVault, VaultError};
use rust_decimal_macros::dec;

fn build(agents: Vec<(u8, Arc<dyn Agent>)>, config: OrchestratorConfig) -> Orchestrator {
    let mut registry = AgentRegistry::new();
    for (tier, agent) in agents {
        registry.register(tier, agent).unwrap();
    }
    Orchestrator::new(
        Arc::new(registry),
        Arc::new(MemoryVault::in_memory().unwrap()),
        config,
    )
}

fn voting(id: &str, action: Action, confidence: u8) -> Arc<dyn Agent> {
    Arc::new(ScriptedAgent::voting(id, action, confidence))
}

fn failing(id: &str) -> Arc<dyn Agent> {
    Arc::new(ScriptedAgent::failing(id))
}

fn request(symbol: &str) -> RunRequest {
    RunRequest::new(symbol, serde_json::json!({}))
}

fn outcome_for(decision_id: uuid::Uuid, symbol: &str, action: Action, pnl: rust_decimal::Decimal) -> DecisionOutcome {
    DecisionOutcome {
        decision_id,
        symbol: symbol.to_string(),
        action,
        pnl,
        positive: pnl > rust_decimal::Decimal::ZERO,
        exit_reason: None,
        observed_at: Utc::now(),
    }
}

#[tokio::test]
async fn two_tier_weighted_buy() {
    let orchestrator = build(
        vec![
            (1, voting("agentA", Action::Buy, 80)),
            (1, voting("agentB", Action::Hold, 60)),
            (2, voting("agentC", Action::Buy, 90)),
        ],
        OrchestratorConfig::default(),
    );

    let report = orchestrator.run(request("AAPL")).await.unwrap();
    let decision = &report.decision;

    assert_eq!(decision.action, Action::Buy);
    assert_eq!(decision.confidence.value(), 57);
    assert_eq!(decision.symbol, "AAPL");
    assert_eq!(
        decision.rationale,
        "agentC (tier 2, weight 90): agentC scripted BUY; agentA (tier 1, weight 80): agentA scripted BUY"
    );
    assert_eq!(report.tiers.len(), 2);
    assert_eq!(decision.trace.len(), 3);
    assert_eq!(report.phases.last(), Some(&RunPhase::Decided));
}

#[tokio::test]
async fn tie_at_the_top_holds() {
    let orchestrator = build(
        vec![
            (1, voting("bull", Action::Buy, 70)),
            (1, voting("bear", Action::Sell, 70)),
        ],
        OrchestratorConfig::default(),
    );

    let decision = orchestrator.run(request("MSFT")).await.unwrap().decision;

    assert_eq!(decision.action, Action::Hold);
}

#[tokio::test]
async fn failed_and_panicked_agents_become_placeholders() {
    let orchestrator = build(
        vec![
            (1, voting("good", Action::Sell, 75)),
            (1, failing("broken")),
            (1, Arc::new(ScriptedAgent::panicking("crashy")) as Arc<dyn Agent>),
        ],
        OrchestratorConfig::default(),
    );

    let report = orchestrator.run(request("TSLA")).await.unwrap();

    let tier = &report.tiers[0];
    assert_eq!(tier.outputs.len(), 3);
    assert_eq!(tier.valid_count(), 1);
    assert_eq!(tier.failed_count(), 2);
    assert_eq!(report.decision.action, Action::Sell);
    assert_eq!(report.decision.confidence.value(), 100);
    assert_eq!(report.decision.factors["total_voters"], 3);
    assert_eq!(report.decision.factors["valid_voters"], 1);
}

#[tokio::test]
async fn too_few_valid_results_skips() {
    let orchestrator = build(
        vec![
            (1, voting("only", Action::Buy, 90)),
            (1, failing("broken")),
        ],
        OrchestratorConfig {
            min_valid_agents: 2,
            ..OrchestratorConfig::default()
        },
    );

    let decision = orchestrator.run(request("NVDA")).await.unwrap().decision;

    assert_eq!(decision.action, Action::Skip);
    assert_eq!(decision.confidence.value(), 0);
}

#[tokio::test]
async fn total_tier_failure_aborts_with_history() {
    let orchestrator = build(
        vec![
            (1, voting("a", Action::Buy, 80)),
            (2, failing("x")),
            (2, failing("y")),
        ],
        OrchestratorConfig::default(),
    );

    let err = orchestrator.run(request("AAPL")).await.unwrap_err();

    match err {
        OrchestratorError::TierTotalFailure { tier, history } => {
            assert_eq!(tier, 2);
            assert_eq!(history.len(), 2);
            assert_eq!(history[0].valid_count(), 1);
            assert!(history[1].all_failed());
        }
        other => panic!("expected total failure, got {other}"),
    }
    assert!(orchestrator.recent_decisions(10).unwrap().is_empty());
}

#[tokio::test]
async fn first_tier_failure_has_no_fallback() {
    let orchestrator = build(
        vec![
            (1, failing("x")),
            (2, voting("b", Action::Buy, 80)),
        ],
        OrchestratorConfig {
            fallback_on_total_failure: true,
            ..OrchestratorConfig::default()
        },
    );

    let err = orchestrator.run(request("AAPL")).await.unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::TierTotalFailure { tier: 1, ref history } if history.len() == 1
    ));
}

#[tokio::test]
async fn fallback_continues_with_earlier_results() {
    let orchestrator = build(
        vec![
            (1, voting("a", Action::Sell, 80)),
            (2, failing("x")),
        ],
        OrchestratorConfig {
            fallback_on_total_failure: true,
            ..OrchestratorConfig::default()
        },
    );

    let report = orchestrator.run(request("AAPL")).await.unwrap();

    assert_eq!(report.decision.action, Action::Sell);
    assert_eq!(report.tiers.len(), 2);
    assert!(report.tiers[1].all_failed());
    assert_eq!(report.decision.trace.len(), 2);
}

#[tokio::test]
async fn slow_agent_times_out() {
    let orchestrator = build(
        vec![
            (1, voting("fast", Action::Buy, 60)),
            (
                1,
                Arc::new(
                    ScriptedAgent::voting("slow", Action::Sell, 99)
                        .with_delay(Duration::from_secs(5)),
                ) as Arc<dyn Agent>,
            ),
        ],
        OrchestratorConfig {
            agent_timeout_ms: 50,
            ..OrchestratorConfig::default()
        },
    );

    let report = orchestrator.run(request("AAPL")).await.unwrap();

    let slow = report.tiers[0]
        .outputs
        .iter()
        .find(|o| o.analysis.agent_id == "slow")
        .unwrap();
    assert!(!slow.is_valid());
    assert!(slow
        .analysis
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("timed out"));
    assert_eq!(report.decision.action, Action::Buy);
}

#[tokio::test]
async fn each_tier_sees_every_earlier_tier() {
    let first = Arc::new(ScriptedAgent::voting("first", Action::Buy, 70));
    let second = Arc::new(ScriptedAgent::voting("second", Action::Buy, 70));
    let third = Arc::new(ScriptedAgent::voting("third", Action::Buy, 70));
    let orchestrator = build(
        vec![
            (1, first.clone() as Arc<dyn Agent>),
            (2, second.clone() as Arc<dyn Agent>),
            (5, third.clone() as Arc<dyn Agent>),
        ],
        OrchestratorConfig::default(),
    );

    orchestrator.run(request("AAPL")).await.unwrap();

    assert_eq!(first.seen_prior_tiers(), vec![0]);
    assert_eq!(second.seen_prior_tiers(), vec![1]);
    assert_eq!(third.seen_prior_tiers(), vec![2]);
}

#[tokio::test]
async fn every_run_persists_one_decision() {
    let orchestrator = build(
        vec![(1, voting("a", Action::Buy, 70))],
        OrchestratorConfig::default(),
    );

    let first = orchestrator.run(request("AAPL")).await.unwrap().decision;
    let second = orchestrator.run(request("MSFT")).await.unwrap().decision;

    let recent = orchestrator.recent_decisions(10).unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].id, second.id);
    assert_eq!(recent[1].id, first.id);
}

#[tokio::test]
async fn outcome_reaches_contributing_agents() {
    let a = Arc::new(ScriptedAgent::voting("a", Action::Buy, 80));
    let b = Arc::new(ScriptedAgent::voting("b", Action::Buy, 60).with_learn_failure());
    let orchestrator = build(
        vec![(1, a.clone() as Arc<dyn Agent>), (2, b.clone() as Arc<dyn Agent>)],
        OrchestratorConfig::default(),
    );

    let decision = orchestrator.run(request("AAPL")).await.unwrap().decision;
    let memory_id = orchestrator
        .record_outcome(outcome_for(decision.id, "AAPL", Action::Buy, dec!(42)))
        .await
        .unwrap();

    assert_eq!(a.learned().len(), 1);
    assert_eq!(b.learned().len(), 1);

    let stored = orchestrator.vault().get(memory_id).await.unwrap().unwrap();
    assert_eq!(stored.memory_type, MemoryType::TradeOutcome);
    assert_eq!(stored.title, "BUY AAPL win");
    assert!(stored.content.contains(&decision.id.to_string()));
    assert!(stored.related_symbols.contains("AAPL"));
    assert_eq!(stored.outcome.map(|o| o.positive), Some(true));
}

#[tokio::test]
async fn outcome_for_unknown_decision_is_rejected() {
    let orchestrator = build(
        vec![(1, voting("a", Action::Buy, 80))],
        OrchestratorConfig::default(),
    );

    let missing = uuid::Uuid::new_v4();
    let err = orchestrator
        .record_outcome(outcome_for(missing, "AAPL", Action::Buy, dec!(-5)))
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::UnknownDecision(id) if id == missing));
}

#[tokio::test]
async fn system_state_counts_agents_and_decisions() {
    let orchestrator = build(
        vec![
            (1, voting("a", Action::Buy, 80)),
            (1, failing("b")),
        ],
        OrchestratorConfig::default(),
    );

    let before = orchestrator.system_state().unwrap();
    assert_eq!(before.agents.total, 2);
    assert_eq!(before.agents.idle, 2);
    assert_eq!(before.decisions_recorded, 0);

    orchestrator.run(request("AAPL")).await.unwrap();

    let after = orchestrator.system_state().unwrap();
    assert_eq!(after.agents.ready, 1);
    assert_eq!(after.agents.error, 1);
    assert_eq!(after.decisions_recorded, 1);
}

#[tokio::test]
async fn losing_trade_gates_the_next_run() {
    let orchestrator = build(
        vec![
            (1, Arc::new(TrendAgent::new("trend")) as Arc<dyn Agent>),
            (
                2,
                Arc::new(RiskGateAgent::new("risk_gate").with_loss_threshold(dec!(100)))
                    as Arc<dyn Agent>,
            ),
        ],
        OrchestratorConfig::default(),
    );
    let market = serde_json::json!({ "closes": rising_closes(100.0, 6) });

    let first = orchestrator
        .run(RunRequest::new("AAPL", market.clone()))
        .await
        .unwrap()
        .decision;
    // trend 80, gate 3/4 of 80.
    assert_eq!(first.action, Action::Buy);
    assert_eq!(first.confidence.value(), 70);

    orchestrator
        .record_outcome(outcome_for(first.id, "AAPL", Action::Buy, dec!(-250)))
        .await
        .unwrap();

    let rules = orchestrator
        .vault()
        .retrieve(&MemoryQuery::of_type(MemoryType::RiskRule))
        .unwrap();
    assert_eq!(rules.len(), 1);
    let learnings = orchestrator
        .vault()
        .retrieve(&MemoryQuery::of_type(MemoryType::Learning))
        .unwrap();
    assert_eq!(learnings.len(), 1);

    let second = orchestrator
        .run(RunRequest::new("AAPL", market))
        .await
        .unwrap()
        .decision;
    assert_eq!(second.action, Action::Hold);
    assert_eq!(second.confidence.value(), 45);
    assert_eq!(second.factors["blocked"], serde_json::json!(["BUY"]));

    // Other symbols are unaffected.
    let other = orchestrator
        .run(RunRequest::new(
            "MSFT",
            serde_json::json!({ "closes": rising_closes(50.0, 6) }),
        ))
        .await
        .unwrap()
        .decision;
    assert_eq!(other.action, Action::Buy);
}

#[tokio::test]
async fn risk_rule_blocks_even_when_crowded_out_of_excerpts() {
    let orchestrator = build(
        vec![(1, voting("bull", Action::Buy, 80))],
        OrchestratorConfig::default(),
    );
    let vault = orchestrator.vault();
    vault
        .store(
            MemoryRecord::new(MemoryType::RiskRule, "No AAPL longs", "halt buys", "ops")
                .with_priority(Priority::High)
                .with_symbols(["AAPL"])
                .with_effect(MemoryEffect::BlockAction { action: Action::Buy }),
        )
        .await
        .unwrap();
    let limit = OrchestratorConfig::default().memory_excerpt_limit;
    for i in 0..limit + 5 {
        vault
            .store(
                MemoryRecord::new(
                    MemoryType::TradeOutcome,
                    format!("fill {i}"),
                    format!("closed trade number {i}"),
                    "orchestrator",
                )
                .with_priority(Priority::Critical)
                .with_symbols(["AAPL"]),
            )
            .await
            .unwrap();
    }

    let report = orchestrator.run(request("AAPL")).await.unwrap();

    assert_eq!(report.decision.action, Action::Hold);
    assert_eq!(report.decision.factors["blocked"], serde_json::json!(["BUY"]));
}

#[tokio::test]
async fn oversized_agent_weight_is_rejected_and_capped_weight_runs() {
    let orchestrator = build(
        vec![
            (1, voting("bull", Action::Buy, 90)),
            (1, voting("bear", Action::Sell, 60)),
        ],
        OrchestratorConfig::default(),
    );
    let vault = orchestrator.vault();
    let weight = |multiplier| {
        MemoryRecord::new(MemoryType::StrategyAdjustment, "Trust bull", "boost", "optimizer")
            .with_effect(MemoryEffect::WeightAgent {
                agent_id: "bull".to_string(),
                multiplier,
            })
            .auto_apply()
    };
    assert!(matches!(
        vault.store(weight(rust_decimal::Decimal::MAX)).await,
        Err(VaultError::Validation(_))
    ));

    let id = vault.store(weight(dec!(100))).await.unwrap();
    vault.apply(id).await.unwrap();
    vault.replay_auto_apply().await.unwrap();

    let decision = orchestrator.run(request("AAPL")).await.unwrap().decision;
    // BUY 9000 vs SELL 60 over 10000 + 100.
    assert_eq!(decision.action, Action::Buy);
    assert_eq!(decision.confidence.value(), 89);
}
