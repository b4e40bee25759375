use std::sync::Arc;
use std::time::{Duration, Instant};

use qtrade_models::agent_message::{AgentOutput, AgentStatus, TierAggregate};
use qtrade_models::config::OrchestratorConfig;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout_at;
use tracing::{error, info, warn};

use crate::agent::{Agent, AgentContext};
use crate::error::{AgentError, TierError};
use crate::registry::AgentRegistry;

/// Runs every agent of one tier concurrently on a bounded worker pool.
#[derive(Debug, Clone)]
pub struct TierExecutor {
    max_concurrency: usize,
    agent_timeout: Duration,
    tier_timeout: Duration,
}

enum Slot {
    Done(AgentOutput),
    Running(String, JoinHandle<AgentOutput>),
}

impl TierExecutor {
    pub fn new(max_concurrency: usize, agent_timeout: Duration, tier_timeout: Duration) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            agent_timeout,
            tier_timeout,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(
            config.max_concurrency,
            Duration::from_millis(config.agent_timeout_ms),
            Duration::from_millis(config.tier_timeout_ms),
        )
    }

    /// Run `analyze` then `decide` for each agent in `agent_ids`.
    ///
    /// The aggregate holds exactly one output per assigned agent, in the
    /// order given. Failed, panicked, timed-out and unknown agents become
    /// error placeholders. If all of them fail the tier fails as a whole.
    pub async fn execute(
        &self,
        registry: &Arc<AgentRegistry>,
        tier: u8,
        agent_ids: &[String],
        context: Arc<AgentContext>,
    ) -> Result<TierAggregate, TierError> {
        let start = Instant::now();
        let tier_deadline = tokio::time::Instant::now() + self.tier_timeout;
        let pool = Arc::new(Semaphore::new(self.max_concurrency));

        let mut slots = Vec::with_capacity(agent_ids.len());
        for id in agent_ids {
            let Some(agent) = registry.get(id) else {
                warn!(agent = %id, tier, "Unknown agent assigned to tier");
                slots.push(Slot::Done(AgentOutput::failed(
                    id.as_str(),
                    tier,
                    "agent is not registered",
                )));
                continue;
            };

            let registry = Arc::clone(registry);
            let context = Arc::clone(&context);
            let pool = Arc::clone(&pool);
            let agent_timeout = self.agent_timeout;
            let agent_id = id.clone();

            let handle = tokio::spawn(async move {
                let permit = match timeout_at(tier_deadline, pool.acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => {
                        return AgentOutput::failed(agent_id, tier, "worker pool closed");
                    }
                    Err(_) => {
                        registry.set_status(&agent_id, AgentStatus::Error);
                        return AgentOutput::failed(
                            agent_id,
                            tier,
                            "tier deadline reached before a worker was free",
                        );
                    }
                };

                registry.set_status(&agent_id, AgentStatus::Active);
                let agent_start = Instant::now();
                let deadline =
                    std::cmp::min(tokio::time::Instant::now() + agent_timeout, tier_deadline);

                let result = match timeout_at(deadline, invoke(agent.as_ref(), &context)).await {
                    Ok(result) => result,
                    Err(_) => Err(AgentError::Timeout(
                        agent_start.elapsed().as_millis() as u64,
                    )),
                };
                drop(permit);

                let elapsed_ms = agent_start.elapsed().as_millis() as u64;
                let mut output = match result {
                    Ok(output) => output,
                    Err(e) => {
                        warn!(agent = %agent_id, tier, error = %e, elapsed_ms, "Agent failed");
                        AgentOutput::failed(agent_id.as_str(), tier, e.to_string())
                    }
                };
                output.analysis.agent_id = agent_id.clone();
                output.analysis.tier = tier;
                output.analysis.elapsed_ms = Some(elapsed_ms);

                let status = if output.is_valid() {
                    AgentStatus::Ready
                } else {
                    AgentStatus::Error
                };
                registry.set_status(&agent_id, status);
                output
            });
            slots.push(Slot::Running(id.clone(), handle));
        }

        // Join barrier: every task is awaited before the tier completes.
        let mut outputs = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                Slot::Done(output) => outputs.push(output),
                Slot::Running(id, handle) => match handle.await {
                    Ok(output) => outputs.push(output),
                    Err(e) => {
                        error!(agent = %id, tier, error = %e, "Agent task panicked");
                        registry.set_status(&id, AgentStatus::Error);
                        outputs.push(AgentOutput::failed(
                            id.as_str(),
                            tier,
                            format!("agent panicked: {e}"),
                        ));
                    }
                },
            }
        }

        let aggregate = TierAggregate {
            tier,
            outputs,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            tier,
            agents = aggregate.outputs.len(),
            valid = aggregate.valid_count(),
            failed = aggregate.failed_count(),
            elapsed_ms = aggregate.elapsed_ms,
            "Tier complete"
        );

        if aggregate.all_failed() {
            return Err(TierError::TotalFailure { tier, aggregate });
        }
        Ok(aggregate)
    }
}

async fn invoke(agent: &dyn Agent, context: &AgentContext) -> Result<AgentOutput, AgentError> {
    let capabilities = agent.capabilities();
    if !capabilities.analyze {
        return Err(AgentError::Capability(format!(
            "{} cannot analyze",
            agent.id()
        )));
    }

    let analysis = agent.analyze(context).await?;
    if analysis.is_error() {
        return Ok(AgentOutput {
            analysis,
            proposal: None,
        });
    }
    if !capabilities.decide {
        return Err(AgentError::Capability(format!(
            "{} cannot decide",
            agent.id()
        )));
    }

    let proposal = agent.decide(&analysis).await?;
    Ok(AgentOutput {
        analysis,
        proposal: Some(proposal),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context_for, ScriptedAgent};
    use qtrade_models::trade_decision::Action;

    fn registry(agents: Vec<ScriptedAgent>) -> Arc<AgentRegistry> {
        let mut registry = AgentRegistry::new();
        for agent in agents {
            registry.register(1, Arc::new(agent)).unwrap();
        }
        Arc::new(registry)
    }

    fn ids(registry: &AgentRegistry) -> Vec<String> {
        registry.tier_plan().remove(&1).unwrap_or_default()
    }

    fn executor() -> TierExecutor {
        TierExecutor::new(4, Duration::from_millis(200), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn failures_become_placeholders() {
        let registry = registry(vec![
            ScriptedAgent::voting("a", Action::Buy, 80),
            ScriptedAgent::failing("b"),
            ScriptedAgent::panicking("c"),
            ScriptedAgent::voting("d", Action::Sell, 40),
        ]);

        let aggregate = executor()
            .execute(&registry, 1, &ids(&registry), Arc::new(context_for("AAPL", 1)))
            .await
            .unwrap();

        assert_eq!(aggregate.outputs.len(), 4);
        assert_eq!(aggregate.valid_count(), 2);
        let order: Vec<&str> = aggregate
            .outputs
            .iter()
            .map(|o| o.analysis.agent_id.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
        assert!(aggregate.outputs[2]
            .analysis
            .error
            .as_deref()
            .unwrap()
            .contains("panicked"));
        assert_eq!(registry.status("a"), Some(AgentStatus::Ready));
        assert_eq!(registry.status("c"), Some(AgentStatus::Error));
    }

    #[tokio::test]
    async fn slow_agent_times_out_alone() {
        let registry = registry(vec![
            ScriptedAgent::voting("fast", Action::Buy, 80),
            ScriptedAgent::voting("slow", Action::Buy, 80).with_delay(Duration::from_secs(5)),
        ]);

        let aggregate = executor()
            .execute(&registry, 1, &ids(&registry), Arc::new(context_for("AAPL", 1)))
            .await
            .unwrap();

        assert!(aggregate.outputs[0].is_valid());
        assert!(!aggregate.outputs[1].is_valid());
        assert!(aggregate.outputs[1]
            .analysis
            .error
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn unknown_agent_is_a_placeholder() {
        let registry = registry(vec![ScriptedAgent::voting("a", Action::Buy, 80)]);
        let assigned = vec!["a".to_string(), "ghost".to_string()];

        let aggregate = executor()
            .execute(&registry, 1, &assigned, Arc::new(context_for("AAPL", 1)))
            .await
            .unwrap();

        assert_eq!(aggregate.outputs.len(), 2);
        assert_eq!(aggregate.outputs[1].analysis.agent_id, "ghost");
        assert!(aggregate.outputs[1].analysis.is_error());
    }

    #[tokio::test]
    async fn all_failed_is_total_failure() {
        let registry = registry(vec![ScriptedAgent::failing("a"), ScriptedAgent::failing("b")]);

        let err = executor()
            .execute(&registry, 1, &ids(&registry), Arc::new(context_for("AAPL", 1)))
            .await
            .unwrap_err();

        let TierError::TotalFailure { tier, aggregate } = err;
        assert_eq!(tier, 1);
        assert_eq!(aggregate.outputs.len(), 2);
    }

    #[tokio::test]
    async fn pool_bounds_concurrency_and_tier_deadline_cancels_waiters() {
        let registry = registry(vec![
            ScriptedAgent::voting("a", Action::Buy, 80).with_delay(Duration::from_millis(150)),
            ScriptedAgent::voting("b", Action::Buy, 80).with_delay(Duration::from_millis(150)),
        ]);
        // One worker: the second agent only starts once the first finishes and
        // is then cut off by the tier deadline.
        let executor =
            TierExecutor::new(1, Duration::from_secs(1), Duration::from_millis(250));

        let aggregate = executor
            .execute(&registry, 1, &ids(&registry), Arc::new(context_for("AAPL", 1)))
            .await
            .unwrap();

        assert!(aggregate.outputs[0].is_valid());
        assert!(!aggregate.outputs[1].is_valid());
    }
}
