use chrono::{DateTime, SecondsFormat, Utc};

/// SQLite schema for the memory vault.
///
/// Queryable fields of a memory are stored as columns next to the full
/// JSON-encoded record, which is the source of truth when reading back.
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS memories (
///     id              TEXT PRIMARY KEY,
///     memory_type     TEXT NOT NULL,
///     priority_rank   INTEGER NOT NULL,
///     applied         INTEGER NOT NULL,
///     auto_apply      INTEGER NOT NULL,
///     created_at      TEXT NOT NULL,
///     valid_until     TEXT,
///     related_symbols TEXT NOT NULL,
///     record_json     TEXT NOT NULL
/// );
/// ```
pub const VAULT_TABLE_DDL: &str = "\
CREATE TABLE IF NOT EXISTS memories (
    id              TEXT PRIMARY KEY,
    memory_type     TEXT NOT NULL,
    priority_rank   INTEGER NOT NULL,
    applied         INTEGER NOT NULL,
    auto_apply      INTEGER NOT NULL,
    created_at      TEXT NOT NULL,
    valid_until     TEXT,
    related_symbols TEXT NOT NULL,
    record_json     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(memory_type);
CREATE INDEX IF NOT EXISTS idx_memories_order ON memories(priority_rank, created_at);
CREATE INDEX IF NOT EXISTS idx_memories_valid_until ON memories(valid_until);

CREATE TABLE IF NOT EXISTS decisions (
    id            TEXT PRIMARY KEY,
    run_id        TEXT NOT NULL,
    symbol        TEXT NOT NULL,
    action        TEXT NOT NULL,
    confidence    INTEGER NOT NULL,
    decided_at    TEXT NOT NULL,
    decision_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_decisions_decided_at ON decisions(decided_at);

CREATE TABLE IF NOT EXISTS runtime_parameters (
    key           TEXT PRIMARY KEY,
    value         TEXT NOT NULL,
    source_memory TEXT,
    updated_at    TEXT NOT NULL
);
";

/// Fixed-width UTC timestamps so text comparison in SQL matches time order.
pub fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Key conventions for the `runtime_parameters` table.
///
/// - Parameters: `param:{name}` (e.g., `param:max_position`)
/// - Blocked actions: `block:{symbol}:{action}` (e.g., `block:AAPL:BUY`)
/// - Agent weights: `weight:{agent_id}` (e.g., `weight:trend`)
pub mod key_patterns {
    use crate::trade_decision::Action;

    pub fn parameter(name: &str) -> String {
        format!("param:{name}")
    }

    pub fn block(symbol: &str, action: Action) -> String {
        format!("block:{symbol}:{action}")
    }

    pub fn weight(agent_id: &str) -> String {
        format!("weight:{agent_id}")
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RuntimeKey {
        Parameter(String),
        Block { symbol: String, action: Action },
        Weight(String),
    }

    pub fn parse(key: &str) -> Option<RuntimeKey> {
        if let Some(name) = key.strip_prefix("param:") {
            return Some(RuntimeKey::Parameter(name.to_string()));
        }
        if let Some(agent_id) = key.strip_prefix("weight:") {
            return Some(RuntimeKey::Weight(agent_id.to_string()));
        }
        let rest = key.strip_prefix("block:")?;
        let (symbol, action) = rest.rsplit_once(':')?;
        Some(RuntimeKey::Block {
            symbol: symbol.to_string(),
            action: action.parse().ok()?,
        })
    }
}
