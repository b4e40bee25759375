pub mod agent_message;
pub mod config;
pub mod memory;
pub mod runtime;
pub mod score;
pub mod state;
pub mod trade_decision;
pub mod trade_input;
pub mod vault_schema;

pub use agent_message::{
    AgentOutput, AgentStatus, AnalysisResult, PartialDecision, ResultStatus, TierAggregate,
};
pub use config::{
    AgentConfig, AgentKind, ConsolidationConfig, OrchestratorConfig, QtradeConfig, VaultConfig,
};
pub use memory::{
    ApplyReport, ConfigChange, ConsolidationReport, MemoryEffect, MemoryQuery, MemoryRecord,
    MemoryType, OutcomeMark, Priority,
};
pub use runtime::RuntimeConfig;
pub use score::{Score, ScoreError};
pub use state::{AgentCounts, SystemState, VaultSummary};
pub use trade_decision::{Action, ContributionTrace, Decision, DecisionOutcome};
pub use trade_input::RunRequest;
