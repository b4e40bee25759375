use qtrade_models::agent_message::TierAggregate;
use qtrade_vault::VaultError;
use thiserror::Error;
use uuid::Uuid;

/// Failure of a single agent call. Never fatal to a tier.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent execution failed: {0}")]
    Execution(String),

    #[error("Agent timed out after {0} ms")]
    Timeout(u64),

    #[error("Agent command error: {0}")]
    Command(String),

    #[error("Agent response parse error: {0}")]
    Parse(String),

    #[error("Agent lacks capability: {0}")]
    Capability(String),

    #[error("Agent registration error: {0}")]
    Registration(String),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum TierError {
    /// Every agent assigned to the tier failed. Carries the placeholders.
    #[error("All {} agents in tier {tier} failed", .aggregate.outputs.len())]
    TotalFailure { tier: u8, aggregate: TierAggregate },
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// A tier failed completely and no fallback context was available.
    /// `history` holds every aggregate produced so far, the failed tier last.
    #[error("Tier {tier} failed completely after {} tier(s) ran", .history.len())]
    TierTotalFailure {
        tier: u8,
        history: Vec<TierAggregate>,
    },

    #[error("No agents registered")]
    NoTiers,

    #[error("Invalid run request: {0}")]
    InvalidRequest(String),

    #[error("Unknown decision: {0}")]
    UnknownDecision(Uuid),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),
}
