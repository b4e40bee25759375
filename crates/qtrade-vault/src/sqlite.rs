use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use rust_decimal::Decimal;
use qtrade_models::memory::{ConfigChange, MemoryQuery, MemoryRecord};
use qtrade_models::trade_decision::Decision;
use qtrade_models::vault_schema::{encode_timestamp, VAULT_TABLE_DDL};
use uuid::Uuid;

use crate::error::VaultError;

/// SQLite persistence for memories, decisions and runtime parameters.
///
/// File databases run in WAL mode so external readers (dashboards, the API
/// layer) can read while the engine writes.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open a read-write connection. Creates the schema if it doesn't exist.
    pub fn open(path: &str) -> Result<Self, VaultError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(VAULT_TABLE_DDL)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self { conn })
    }

    /// Open an in-memory database for testing.
    pub fn open_in_memory() -> Result<Self, VaultError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(VAULT_TABLE_DDL)?;
        Ok(Self { conn })
    }

    pub fn get_memory(&self, id: Uuid) -> Result<Option<MemoryRecord>, VaultError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT record_json FROM memories WHERE id = ?1")?;
        let json: Option<String> = stmt
            .query_row(params![id.to_string()], |row| row.get(0))
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(VaultError::from))
            .transpose()
    }

    pub fn contains_memory(&self, id: Uuid) -> Result<bool, VaultError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Insert or replace a memory row.
    pub fn upsert_memory(&self, record: &MemoryRecord) -> Result<(), VaultError> {
        upsert_memory_on(&self.conn, record)
    }

    /// Atomically delete `replaced` and insert `record`.
    pub fn replace_memory(
        &mut self,
        replaced: Uuid,
        record: &MemoryRecord,
    ) -> Result<(), VaultError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM memories WHERE id = ?1",
            params![replaced.to_string()],
        )?;
        upsert_memory_on(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    /// Run a memory query. Ordering: priority descending, then newest first.
    pub fn query_memories(
        &self,
        query: &MemoryQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<MemoryRecord>, VaultError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(memory_type) = query.memory_type {
            clauses.push("memory_type = ?");
            values.push(Value::Text(memory_type.as_str().to_string()));
        }
        if let Some(symbol) = &query.symbol {
            clauses.push(
                "EXISTS (SELECT 1 FROM json_each(memories.related_symbols) \
                 WHERE json_each.value = ?)",
            );
            values.push(Value::Text(symbol.trim().to_ascii_uppercase()));
        }
        if let Some(min_priority) = query.min_priority {
            clauses.push("priority_rank >= ?");
            values.push(Value::Integer(min_priority.rank()));
        }
        if let Some(since) = &query.since {
            clauses.push("created_at >= ?");
            values.push(Value::Text(encode_timestamp(since)));
        }
        if let Some(until) = &query.until {
            clauses.push("created_at <= ?");
            values.push(Value::Text(encode_timestamp(until)));
        }
        if let Some(applied) = query.applied {
            clauses.push("applied = ?");
            values.push(Value::Integer(applied as i64));
        }
        if !query.include_expired {
            clauses.push("(valid_until IS NULL OR valid_until >= ?)");
            values.push(Value::Text(encode_timestamp(&now)));
        }

        let mut sql = String::from("SELECT record_json FROM memories");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY priority_rank DESC, created_at DESC");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        decode_records(rows)
    }

    /// Every record, expired ones included, oldest first.
    pub fn all_memories(&self) -> Result<Vec<MemoryRecord>, VaultError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT record_json FROM memories ORDER BY created_at ASC")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        decode_records(rows)
    }

    /// Records flagged both applied and auto-apply, oldest first.
    pub fn applied_auto_apply(&self) -> Result<Vec<MemoryRecord>, VaultError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT record_json FROM memories WHERE applied = 1 AND auto_apply = 1 \
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        decode_records(rows)
    }

    pub fn count_memories(&self, applied: Option<bool>) -> Result<usize, VaultError> {
        let count: i64 = match applied {
            Some(flag) => self.conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE applied = ?1",
                params![flag as i64],
                |row| row.get(0),
            )?,
            None => self
                .conn
                .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?,
        };
        Ok(count as usize)
    }

    /// Write the runtime entries produced by applying `record` and persist the
    /// record itself, all in one transaction. Only entries whose value actually
    /// changed are reported.
    pub fn apply_memory(
        &mut self,
        record: &MemoryRecord,
        entries: &[(String, Decimal)],
    ) -> Result<Vec<ConfigChange>, VaultError> {
        let now = encode_timestamp(&Utc::now());
        let tx = self.conn.transaction()?;
        let mut changes = Vec::new();
        {
            let mut select =
                tx.prepare_cached("SELECT value FROM runtime_parameters WHERE key = ?1")?;
            let mut upsert = tx.prepare_cached(
                "INSERT OR REPLACE INTO runtime_parameters (key, value, source_memory, updated_at) \
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (key, value) in entries {
                let previous: Option<String> =
                    select.query_row(params![key], |row| row.get(0)).optional()?;
                let previous = previous.map(|p| decode_decimal(&p)).transpose()?;
                if previous == Some(*value) {
                    continue;
                }
                upsert.execute(params![key, value.to_string(), record.id.to_string(), now])?;
                changes.push(ConfigChange {
                    key: key.clone(),
                    previous,
                    current: *value,
                });
            }
        }
        upsert_memory_on(&tx, record)?;
        tx.commit()?;
        Ok(changes)
    }

    pub fn runtime_entries(&self) -> Result<Vec<(String, Decimal)>, VaultError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT key, value FROM runtime_parameters ORDER BY key")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(key, value)| Ok((key, decode_decimal(&value)?)))
            .collect()
    }

    /// Apply a consolidation result: rewrite updated records, delete the rest.
    pub fn commit_consolidation(
        &mut self,
        updates: &[MemoryRecord],
        deletions: &[Uuid],
    ) -> Result<(), VaultError> {
        let tx = self.conn.transaction()?;
        for record in updates {
            upsert_memory_on(&tx, record)?;
        }
        {
            let mut delete = tx.prepare_cached("DELETE FROM memories WHERE id = ?1")?;
            for id in deletions {
                delete.execute(params![id.to_string()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Insert a decision. Decisions are immutable, so an existing id is an error.
    pub fn insert_decision(&self, decision: &Decision) -> Result<(), VaultError> {
        let json = serde_json::to_string(decision)?;
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO decisions \
             (id, run_id, symbol, action, confidence, decided_at, decision_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                decision.id.to_string(),
                decision.run_id.to_string(),
                decision.symbol,
                decision.action.as_str(),
                decision.confidence.value() as i64,
                encode_timestamp(&decision.timestamp),
                json,
            ],
        )?;
        if inserted == 0 {
            return Err(VaultError::Validation(format!(
                "decision {} already recorded",
                decision.id
            )));
        }
        Ok(())
    }

    pub fn get_decision(&self, id: Uuid) -> Result<Option<Decision>, VaultError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT decision_json FROM decisions WHERE id = ?1")?;
        let json: Option<String> = stmt
            .query_row(params![id.to_string()], |row| row.get(0))
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(VaultError::from))
            .transpose()
    }

    /// Most recent decisions first.
    pub fn recent_decisions(&self, limit: usize) -> Result<Vec<Decision>, VaultError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT decision_json FROM decisions ORDER BY decided_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|j| serde_json::from_str(j).map_err(VaultError::from))
            .collect()
    }

    pub fn count_decisions(&self) -> Result<usize, VaultError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM decisions", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn upsert_memory_on(conn: &Connection, record: &MemoryRecord) -> Result<(), VaultError> {
    let symbols = serde_json::to_string(&record.related_symbols)?;
    let json = serde_json::to_string(record)?;
    conn.execute(
        "INSERT OR REPLACE INTO memories \
         (id, memory_type, priority_rank, applied, auto_apply, created_at, valid_until, \
          related_symbols, record_json) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.id.to_string(),
            record.memory_type.as_str(),
            record.priority.rank(),
            record.applied as i64,
            record.auto_apply as i64,
            encode_timestamp(&record.created_at),
            record.valid_until.as_ref().map(encode_timestamp),
            symbols,
            json,
        ],
    )?;
    Ok(())
}

fn decode_records(rows: Vec<String>) -> Result<Vec<MemoryRecord>, VaultError> {
    rows.iter()
        .map(|j| serde_json::from_str(j).map_err(VaultError::from))
        .collect()
}

fn decode_decimal(raw: &str) -> Result<Decimal, VaultError> {
    Decimal::from_str(raw).map_err(|e| VaultError::Decode(format!("{raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use qtrade_models::memory::{MemoryType, Priority};

    fn make_record(title: &str, priority: Priority, age_minutes: i64) -> MemoryRecord {
        let mut record = MemoryRecord::new(MemoryType::Learning, title, "content", "test")
            .with_priority(priority)
            .with_symbols(["AAPL"]);
        record.id = Uuid::new_v4();
        record.created_at = Utc::now() - Duration::minutes(age_minutes);
        record
    }

    #[test]
    fn upsert_and_get() {
        let store = SqliteStore::open_in_memory().unwrap();
        let record = make_record("first", Priority::High, 0);
        store.upsert_memory(&record).unwrap();

        let loaded = store.get_memory(record.id).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.get_memory(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn query_orders_by_priority_then_recency() {
        let store = SqliteStore::open_in_memory().unwrap();
        let old_high = make_record("old high", Priority::High, 30);
        let new_high = make_record("new high", Priority::High, 1);
        let critical = make_record("critical", Priority::Critical, 60);
        let low = make_record("low", Priority::Low, 0);
        for r in [&old_high, &new_high, &critical, &low] {
            store.upsert_memory(r).unwrap();
        }

        let titles: Vec<String> = store
            .query_memories(&MemoryQuery::default(), Utc::now())
            .unwrap()
            .into_iter()
            .map(|r| r.title)
            .collect();
        assert_eq!(titles, vec!["critical", "new high", "old high", "low"]);
    }

    #[test]
    fn query_filters_symbol_and_expiry() {
        let store = SqliteStore::open_in_memory().unwrap();
        let aapl = make_record("aapl", Priority::Medium, 0);
        let tsla = make_record("tsla", Priority::Medium, 0).with_symbols(["TSLA"]);
        let mut expired = make_record("expired", Priority::Medium, 0);
        expired.valid_until = Some(Utc::now() - Duration::minutes(5));
        for r in [&aapl, &tsla, &expired] {
            store.upsert_memory(r).unwrap();
        }

        let by_symbol = store
            .query_memories(&MemoryQuery::for_symbol("aapl"), Utc::now())
            .unwrap();
        assert_eq!(by_symbol.len(), 1);
        assert_eq!(by_symbol[0].title, "aapl");

        let audit = MemoryQuery {
            symbol: Some("AAPL".to_string()),
            include_expired: true,
            ..MemoryQuery::default()
        };
        assert_eq!(store.query_memories(&audit, Utc::now()).unwrap().len(), 2);
    }

    #[test]
    fn query_filters_priority_dates_and_applied() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let old_low = make_record("old low", Priority::Low, 120);
        let mut old_high = make_record("old high", Priority::High, 90);
        old_high.applied = true;
        let mid_critical = make_record("mid critical", Priority::Critical, 30);
        let mut fresh_medium = make_record("fresh medium", Priority::Medium, 1);
        fresh_medium.applied = true;
        for r in [&old_low, &old_high, &mid_critical, &fresh_medium] {
            store.upsert_memory(r).unwrap();
        }
        let titles = |query: MemoryQuery| -> Vec<String> {
            store
                .query_memories(&query, now)
                .unwrap()
                .into_iter()
                .map(|r| r.title)
                .collect()
        };

        assert_eq!(
            titles(MemoryQuery {
                min_priority: Some(Priority::High),
                ..MemoryQuery::default()
            }),
            vec!["mid critical", "old high"]
        );
        assert_eq!(
            titles(MemoryQuery {
                since: Some(now - Duration::minutes(60)),
                ..MemoryQuery::default()
            }),
            vec!["mid critical", "fresh medium"]
        );
        assert_eq!(
            titles(MemoryQuery {
                until: Some(now - Duration::minutes(60)),
                ..MemoryQuery::default()
            }),
            vec!["old high", "old low"]
        );
        assert_eq!(
            titles(MemoryQuery {
                applied: Some(true),
                ..MemoryQuery::default()
            }),
            vec!["old high", "fresh medium"]
        );
        assert_eq!(
            titles(MemoryQuery {
                applied: Some(false),
                ..MemoryQuery::default()
            }),
            vec!["mid critical", "old low"]
        );

        // Filters combine with AND.
        assert_eq!(
            titles(MemoryQuery {
                min_priority: Some(Priority::Medium),
                since: Some(now - Duration::minutes(100)),
                until: Some(now - Duration::minutes(10)),
                applied: Some(false),
                ..MemoryQuery::default()
            }),
            vec!["mid critical"]
        );
        assert_eq!(
            titles(MemoryQuery {
                min_priority: Some(Priority::Medium),
                since: Some(now - Duration::minutes(100)),
                applied: Some(true),
                limit: Some(1),
                ..MemoryQuery::default()
            }),
            vec!["old high"]
        );
    }

    #[test]
    fn apply_memory_reports_only_real_changes() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let record = make_record("weights", Priority::Medium, 0);
        let entries = vec![("weight:trend".to_string(), Decimal::new(15, 1))];

        let first = store.apply_memory(&record, &entries).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].previous, None);

        let second = store.apply_memory(&record, &entries).unwrap();
        assert!(second.is_empty());
        assert_eq!(store.runtime_entries().unwrap(), entries);
    }

    #[test]
    fn commit_consolidation_updates_and_deletes() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let keep = make_record("keep", Priority::Low, 0);
        let dropped = make_record("dropped", Priority::Low, 0);
        store.upsert_memory(&keep).unwrap();
        store.upsert_memory(&dropped).unwrap();

        let mut updated = keep.clone();
        updated.priority = Priority::High;
        store
            .commit_consolidation(&[updated], &[dropped.id])
            .unwrap();

        assert_eq!(store.count_memories(None).unwrap(), 1);
        assert_eq!(
            store.get_memory(keep.id).unwrap().unwrap().priority,
            Priority::High
        );
    }

    #[test]
    fn wal_mode_on_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
        assert_eq!(store.count_memories(None).unwrap(), 0);
    }
}
