use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Longest grace period accepted for unscored expired records (ten years).
pub const MAX_GRACE_PERIOD_HOURS: i64 = 24 * 365 * 10;

/// Longest intelligence-score window accepted (ten years).
pub const MAX_INTELLIGENCE_WINDOW_DAYS: i64 = 365 * 10;

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QtradeConfig {
    pub vault: VaultConfig,
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentConfig>,
}

impl Default for QtradeConfig {
    fn default() -> Self {
        Self {
            vault: VaultConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            consolidation: ConsolidationConfig::default(),
            agents: default_agents(),
        }
    }
}

/// Configuration for the memory vault.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VaultConfig {
    /// Path to the SQLite vault file.
    pub sqlite_path: String,
    /// Maximum number of records kept in the in-memory moka cache.
    #[serde(default = "default_hot_capacity")]
    pub hot_cache_capacity: u64,
    /// How long a record read stays in the hot cache.
    #[serde(default = "default_hot_ttl")]
    pub hot_cache_ttl_seconds: u64,
    /// Window (days) of records averaged into the intelligence score.
    #[serde(default = "default_intelligence_window")]
    pub intelligence_window_days: i64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "data/qtrade_vault.db".to_string(),
            hot_cache_capacity: default_hot_capacity(),
            hot_cache_ttl_seconds: default_hot_ttl(),
            intelligence_window_days: default_intelligence_window(),
        }
    }
}

/// Configuration for tier execution and synthesis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// Per-agent timeout covering `analyze` + `decide`.
    pub agent_timeout_ms: u64,
    /// Deadline for a whole tier; agents still running are cancelled.
    pub tier_timeout_ms: u64,
    /// Worker pool size: maximum agents running at once within a tier.
    pub max_concurrency: usize,
    /// Below this many valid results the run decides SKIP.
    pub min_valid_agents: usize,
    /// Continue past a totally failed tier when earlier tiers produced results.
    #[serde(default)]
    pub fallback_on_total_failure: bool,
    /// Maximum number of vault excerpts placed in the agent context.
    #[serde(default = "default_memory_excerpts")]
    pub memory_excerpt_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            agent_timeout_ms: 10_000,
            tier_timeout_ms: 30_000,
            max_concurrency: 8,
            min_valid_agents: 1,
            fallback_on_total_failure: false,
            memory_excerpt_limit: default_memory_excerpts(),
        }
    }
}

/// Thresholds for the consolidation pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Jaccard similarity (0.0-1.0) at which two memories count as duplicates.
    pub similarity_threshold: f64,
    /// Expired records scoring below this are pruned.
    pub low_value_threshold: u8,
    /// Expired records with no score are pruned once expired this long.
    pub grace_period_hours: i64,
    /// Effectiveness added per strengthening.
    pub strengthen_step: u8,
    /// Later positive outcomes needed before a TRADE_OUTCOME is strengthened.
    pub min_confirmations: usize,
    pub promote_on_strengthen: bool,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            low_value_threshold: 30,
            grace_period_hours: 72,
            strengthen_step: 10,
            min_confirmations: 2,
            promote_on_strengthen: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Trend,
    RiskGate,
    Command,
}

/// Configuration for a single agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub id: String,
    pub tier: u8,
    pub kind: AgentKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Executable for `command` agents.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Market context key holding the close series (`trend` agents).
    #[serde(default)]
    pub series_key: Option<String>,
    /// Consecutive closes needed for a directional vote (`trend` agents).
    #[serde(default)]
    pub min_run: Option<u32>,
    /// Per-call timeout for `command` agents.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Loss magnitude that makes a `risk_gate` agent record a risk rule.
    #[serde(default)]
    pub loss_threshold: Option<Decimal>,
}

impl AgentConfig {
    pub fn new(id: &str, tier: u8, kind: AgentKind) -> Self {
        Self {
            id: id.to_string(),
            tier,
            kind,
            enabled: true,
            command: None,
            args: vec![],
            series_key: None,
            min_run: None,
            timeout_seconds: None,
            loss_threshold: None,
        }
    }
}

fn default_agents() -> Vec<AgentConfig> {
    vec![
        AgentConfig::new("trend", 1, AgentKind::Trend),
        AgentConfig::new("risk_gate", 2, AgentKind::RiskGate),
    ]
}

fn default_true() -> bool {
    true
}
fn default_hot_capacity() -> u64 {
    10_000
}
fn default_hot_ttl() -> u64 {
    60
}
fn default_intelligence_window() -> i64 {
    30
}
fn default_memory_excerpts() -> usize {
    25
}
