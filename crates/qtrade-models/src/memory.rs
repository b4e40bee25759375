use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::score::Score;
use crate::trade_decision::Action;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryType {
    BattlePlan,
    Learning,
    ErrorFix,
    StrategyAdjustment,
    RiskRule,
    PatternInsight,
    TradeOutcome,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::BattlePlan => "BATTLE_PLAN",
            MemoryType::Learning => "LEARNING",
            MemoryType::ErrorFix => "ERROR_FIX",
            MemoryType::StrategyAdjustment => "STRATEGY_ADJUSTMENT",
            MemoryType::RiskRule => "RISK_RULE",
            MemoryType::PatternInsight => "PATTERN_INSIGHT",
            MemoryType::TradeOutcome => "TRADE_OUTCOME",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "BATTLE_PLAN" => Ok(MemoryType::BattlePlan),
            "LEARNING" => Ok(MemoryType::Learning),
            "ERROR_FIX" => Ok(MemoryType::ErrorFix),
            "STRATEGY_ADJUSTMENT" => Ok(MemoryType::StrategyAdjustment),
            "RISK_RULE" => Ok(MemoryType::RiskRule),
            "PATTERN_INSIGHT" => Ok(MemoryType::PatternInsight),
            "TRADE_OUTCOME" => Ok(MemoryType::TradeOutcome),
            other => Err(format!("unknown memory type: {other}")),
        }
    }
}

/// Memory priority. Declaration order gives `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn rank(&self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }

    /// One level up, saturating at `Critical`.
    pub fn promote(&self) -> Priority {
        match self {
            Priority::Low => Priority::Medium,
            Priority::Medium => Priority::High,
            Priority::High | Priority::Critical => Priority::Critical,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Priority::Low),
            "MEDIUM" => Ok(Priority::Medium),
            "HIGH" => Ok(Priority::High),
            "CRITICAL" => Ok(Priority::Critical),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// The concrete system change a memory performs when applied.
///
/// Every variant sets a value rather than adjusting one, which is what makes
/// re-applying an `auto_apply` record after a restart safe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryEffect {
    SetParameter { name: String, value: Decimal },
    /// Forbid `action` for each of the record's related symbols.
    BlockAction { action: Action },
    WeightAgent { agent_id: String, multiplier: Decimal },
}

/// Attached to TRADE_OUTCOME memories so consolidation can correlate results.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutcomeMark {
    pub action: Action,
    pub positive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    /// Nil until the vault assigns an id on `store`.
    #[serde(default)]
    pub id: Uuid,
    pub memory_type: MemoryType,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub priority: Priority,
    pub source_agent: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub applied: bool,
    #[serde(default)]
    pub auto_apply: bool,
    #[serde(default)]
    pub related_symbols: BTreeSet<String>,
    #[serde(default)]
    pub effectiveness_score: Option<Score>,
    #[serde(default)]
    pub effect: Option<MemoryEffect>,
    #[serde(default)]
    pub outcome: Option<OutcomeMark>,
    #[serde(default)]
    pub last_strengthened: Option<DateTime<Utc>>,
    /// Explicitly replaces an older record of the same type and symbols.
    #[serde(default)]
    pub supersedes: Option<Uuid>,
}

impl MemoryRecord {
    pub fn new(
        memory_type: MemoryType,
        title: impl Into<String>,
        content: impl Into<String>,
        source_agent: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::nil(),
            memory_type,
            title: title.into(),
            content: content.into(),
            priority: Priority::default(),
            source_agent: source_agent.into(),
            created_at: Utc::now(),
            valid_from: None,
            valid_until: None,
            applied: false,
            auto_apply: false,
            related_symbols: BTreeSet::new(),
            effectiveness_score: None,
            effect: None,
            outcome: None,
            last_strengthened: None,
            supersedes: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.related_symbols = symbols
            .into_iter()
            .map(|s| s.as_ref().trim().to_ascii_uppercase())
            .collect();
        self
    }

    pub fn with_effect(mut self, effect: MemoryEffect) -> Self {
        self.effect = Some(effect);
        self
    }

    pub fn with_validity(
        mut self,
        valid_from: Option<DateTime<Utc>>,
        valid_until: Option<DateTime<Utc>>,
    ) -> Self {
        self.valid_from = valid_from;
        self.valid_until = valid_until;
        self
    }

    pub fn auto_apply(mut self) -> Self {
        self.auto_apply = true;
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|until| until < now)
    }

    /// Active records have started (or have no start) and have not expired.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired_at(now) && self.valid_from.map_or(true, |from| from <= now)
    }

    /// An applied record may be applied again only when it is `auto_apply`.
    pub fn is_reapplicable(&self) -> bool {
        self.auto_apply
    }

    /// RISK_RULE and CRITICAL memories are never removed by consolidation.
    pub fn is_protected(&self) -> bool {
        self.memory_type == MemoryType::RiskRule || self.priority == Priority::Critical
    }
}

/// Conjunction of optional filters for `retrieve`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MemoryQuery {
    pub memory_type: Option<MemoryType>,
    pub symbol: Option<String>,
    pub min_priority: Option<Priority>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub applied: Option<bool>,
    /// Audit mode: also return records past `valid_until`.
    #[serde(default)]
    pub include_expired: bool,
    pub limit: Option<usize>,
}

impl MemoryQuery {
    pub fn of_type(memory_type: MemoryType) -> Self {
        Self {
            memory_type: Some(memory_type),
            ..Self::default()
        }
    }

    pub fn for_symbol(symbol: impl AsRef<str>) -> Self {
        Self {
            symbol: Some(symbol.as_ref().trim().to_ascii_uppercase()),
            ..Self::default()
        }
    }
}

/// One concrete change made to the runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigChange {
    pub key: String,
    pub previous: Option<Decimal>,
    pub current: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplyReport {
    pub memory_id: Uuid,
    pub changes: Vec<ConfigChange>,
    /// True when an already-applied auto-apply record was applied again.
    pub replayed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsolidationReport {
    pub groups: usize,
    pub deduplicated: usize,
    pub pruned: usize,
    pub strengthened: usize,
    pub promoted: usize,
    pub elapsed_ms: u64,
}
