//! qtrade - tiered multi-agent trading decisions with a persistent memory vault.
//!
//! Agents run tier by tier, each tier seeing every earlier tier's results,
//! and the orchestrator reduces all votes into one weighted decision. What
//! the agents learn from outcomes is kept in the memory vault and fed back
//! into later runs.
//!
//! # Library Usage
//!
//! ```rust,no_run
//! use qtrade::models::{QtradeConfig, RunRequest};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let orchestrator = qtrade::build_orchestrator(&QtradeConfig::default())?;
//! let report = orchestrator
//!     .run(RunRequest::new("AAPL", serde_json::json!({ "closes": [1.0, 2.0, 3.0, 4.0] })))
//!     .await?;
//! println!("{}", report.decision.action);
//! # Ok(())
//! # }
//! ```

pub use qtrade_agents as agents;
pub use qtrade_models as models;
pub use qtrade_vault as vault;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use qtrade_agents::{
    Agent, AgentRegistry, CommandAgent, CommandConfig, Orchestrator, RiskGateAgent, TrendAgent,
};
use qtrade_models::config::{AgentConfig, AgentKind, QtradeConfig};
use qtrade_vault::MemoryVault;

/// Read and parse a TOML configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<QtradeConfig, anyhow::Error> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Failed to parse config: {}", path.display()))
}

/// Instantiate one configured agent.
pub fn build_agent(config: &AgentConfig) -> Result<Arc<dyn Agent>, anyhow::Error> {
    let agent: Arc<dyn Agent> = match config.kind {
        AgentKind::Trend => {
            let mut agent = TrendAgent::new(config.id.clone());
            if let Some(key) = &config.series_key {
                agent = agent.with_series_key(key.clone());
            }
            if let Some(min_run) = config.min_run {
                agent = agent.with_min_run(min_run);
            }
            Arc::new(agent)
        }
        AgentKind::RiskGate => {
            let mut agent = RiskGateAgent::new(config.id.clone());
            if let Some(threshold) = config.loss_threshold {
                agent = agent.with_loss_threshold(threshold);
            }
            Arc::new(agent)
        }
        AgentKind::Command => {
            let Some(program) = &config.command else {
                bail!("command agent {} has no `command`", config.id);
            };
            let mut command = CommandConfig::new(program.clone());
            command.args = config.args.clone();
            if let Some(seconds) = config.timeout_seconds {
                command.timeout = Duration::from_secs(seconds);
            }
            Arc::new(CommandAgent::new(config.id.clone(), command))
        }
    };
    Ok(agent)
}

/// Register every enabled agent at its configured tier.
pub fn build_registry(agents: &[AgentConfig]) -> Result<AgentRegistry, anyhow::Error> {
    let mut registry = AgentRegistry::new();
    for config in agents.iter().filter(|a| a.enabled) {
        let agent = build_agent(config)?;
        registry
            .register(config.tier, agent)
            .with_context(|| format!("Failed to register agent {}", config.id))?;
    }
    Ok(registry)
}

/// Open the vault and wire an orchestrator from configuration.
pub fn build_orchestrator(config: &QtradeConfig) -> Result<Orchestrator, anyhow::Error> {
    let vault = MemoryVault::open(&config.vault)
        .with_context(|| format!("Failed to open vault: {}", config.vault.sqlite_path))?;
    build_orchestrator_with_vault(config, Arc::new(vault))
}

/// Wire an orchestrator around an already open vault.
pub fn build_orchestrator_with_vault(
    config: &QtradeConfig,
    vault: Arc<MemoryVault>,
) -> Result<Orchestrator, anyhow::Error> {
    let registry = build_registry(&config.agents)?;
    Ok(Orchestrator::new(
        Arc::new(registry),
        vault,
        config.orchestrator.clone(),
    ))
}
