use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use qtrade_models::config::{ConsolidationConfig, VaultConfig, MAX_INTELLIGENCE_WINDOW_DAYS};
use qtrade_models::memory::{
    ApplyReport, ConsolidationReport, MemoryEffect, MemoryQuery, MemoryRecord, MemoryType,
};
use qtrade_models::runtime::{RuntimeConfig, MAX_AGENT_WEIGHT};
use qtrade_models::score::Score;
use qtrade_models::state::VaultSummary;
use qtrade_models::trade_decision::Decision;
use qtrade_models::vault_schema::key_patterns;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::consolidation;
use crate::error::VaultError;
use crate::hot_cache::HotCache;
use crate::sqlite::SqliteStore;

/// Lock-table size above which idle per-record locks are dropped.
const RECORD_LOCK_SWEEP_THRESHOLD: usize = 1024;

/// Durable store of memories and decisions.
///
/// Reads go moka (hot) → SQLite. Writes to one record are serialized through
/// a per-id async lock; consolidation additionally takes the vault-wide gate
/// exclusively so its grouping pass sees a consistent snapshot.
///
/// SQLite access is synchronized via `Mutex` since `rusqlite::Connection` is not `Sync`.
pub struct MemoryVault {
    sqlite: Mutex<SqliteStore>,
    hot: HotCache,
    record_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    gate: RwLock<()>,
    consolidating: AtomicBool,
    intelligence_window: chrono::Duration,
}

/// Clears the in-progress flag when a consolidation pass ends, even on error.
struct ConsolidationFlag<'a>(&'a AtomicBool);

impl Drop for ConsolidationFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl MemoryVault {
    pub fn new(sqlite: SqliteStore, max_capacity: u64, hot_ttl: Duration) -> Self {
        Self {
            sqlite: Mutex::new(sqlite),
            hot: HotCache::new(max_capacity, hot_ttl),
            record_locks: Mutex::new(HashMap::new()),
            gate: RwLock::new(()),
            consolidating: AtomicBool::new(false),
            intelligence_window: chrono::Duration::days(30),
        }
    }

    /// Open the vault described by `config`, creating the database if needed.
    pub fn open(config: &VaultConfig) -> Result<Self, VaultError> {
        let days = config.intelligence_window_days;
        let window = (1..=MAX_INTELLIGENCE_WINDOW_DAYS)
            .contains(&days)
            .then(|| chrono::Duration::try_days(days))
            .flatten()
            .ok_or_else(|| {
                VaultError::Validation(format!(
                    "intelligence_window_days {days} is outside 1-{MAX_INTELLIGENCE_WINDOW_DAYS}"
                ))
            })?;
        let sqlite = SqliteStore::open(&config.sqlite_path)?;
        Ok(Self::new(
            sqlite,
            config.hot_cache_capacity,
            Duration::from_secs(config.hot_cache_ttl_seconds),
        )
        .with_intelligence_window(window))
    }

    /// In-memory vault for tests and dry runs.
    pub fn in_memory() -> Result<Self, VaultError> {
        Ok(Self::new(
            SqliteStore::open_in_memory()?,
            1_000,
            Duration::from_secs(60),
        ))
    }

    pub fn with_intelligence_window(mut self, window: chrono::Duration) -> Self {
        self.intelligence_window = window;
        self
    }

    fn store_lock(&self) -> Result<MutexGuard<'_, SqliteStore>, VaultError> {
        self.sqlite
            .lock()
            .map_err(|e| VaultError::Unavailable(format!("SQLite mutex poisoned: {e}")))
    }

    fn record_lock(&self, id: Uuid) -> Result<Arc<tokio::sync::Mutex<()>>, VaultError> {
        let mut locks = self
            .record_locks
            .lock()
            .map_err(|e| VaultError::Unavailable(format!("lock table poisoned: {e}")))?;
        if locks.len() > RECORD_LOCK_SWEEP_THRESHOLD {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Ok(Arc::clone(locks.entry(id).or_default()))
    }

    /// Validate and persist a new memory, returning its id.
    ///
    /// A nil id is replaced with a fresh one. When `supersedes` names an older
    /// record of the same type and symbols, that record is removed in the same
    /// transaction.
    pub async fn store(&self, mut record: MemoryRecord) -> Result<Uuid, VaultError> {
        validate_record(&mut record)?;
        if record.id.is_nil() {
            record.id = Uuid::new_v4();
        }

        let _gate = self.gate.read().await;
        let lock = self.record_lock(record.id)?;
        let _guard = lock.lock().await;

        if let Some(old_id) = record.supersedes {
            let old_lock = self.record_lock(old_id)?;
            let _old_guard = old_lock.lock().await;
            {
                let mut sqlite = self.store_lock()?;
                ensure_absent(&sqlite, record.id)?;
                let old = sqlite
                    .get_memory(old_id)?
                    .ok_or(VaultError::NotFound(old_id))?;
                check_supersede(&old, &record)?;
                sqlite.replace_memory(old_id, &record)?;
            }
            self.hot.invalidate(&old_id).await;
            info!(id = %record.id, superseded = %old_id, memory_type = %record.memory_type, "Memory superseded");
        } else {
            {
                let sqlite = self.store_lock()?;
                ensure_absent(&sqlite, record.id)?;
                sqlite.upsert_memory(&record)?;
            }
            debug!(id = %record.id, memory_type = %record.memory_type, "Memory stored");
        }

        self.hot.invalidate(&record.id).await;
        Ok(record.id)
    }

    /// Get a record by id. Checks moka first, then SQLite, promoting hits.
    pub async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>, VaultError> {
        if let Some(record) = self.hot.get(&id).await {
            return Ok(Some(record));
        }

        let record = self.store_lock()?.get_memory(id)?;
        if let Some(record) = &record {
            self.hot.insert(record.clone()).await;
        }
        Ok(record)
    }

    /// Matching records ordered by priority (highest first) then newest first.
    /// Expired records are only included in audit mode.
    pub fn retrieve(&self, query: &MemoryQuery) -> Result<Vec<MemoryRecord>, VaultError> {
        self.store_lock()?.query_memories(query, Utc::now())
    }

    /// Execute a memory's effect against the runtime configuration.
    pub async fn apply(&self, id: Uuid) -> Result<ApplyReport, VaultError> {
        let _gate = self.gate.read().await;
        let lock = self.record_lock(id)?;
        let _guard = lock.lock().await;

        let (record, changes, replayed) = {
            let mut sqlite = self.store_lock()?;
            let mut record = sqlite.get_memory(id)?.ok_or(VaultError::NotFound(id))?;
            if record.applied && !record.is_reapplicable() {
                return Err(VaultError::AlreadyApplied(id));
            }
            let replayed = record.applied;
            let entries = effect_entries(&record);
            record.applied = true;
            let changes = sqlite.apply_memory(&record, &entries)?;
            (record, changes, replayed)
        };

        self.hot.invalidate(&id).await;
        info!(
            id = %id,
            memory_type = %record.memory_type,
            changes = changes.len(),
            replayed,
            "Memory applied"
        );

        Ok(ApplyReport {
            memory_id: id,
            changes,
            replayed,
        })
    }

    /// Re-apply every applied auto-apply record, e.g. after a restart.
    pub async fn replay_auto_apply(&self) -> Result<Vec<ApplyReport>, VaultError> {
        let records = self.store_lock()?.applied_auto_apply()?;
        let mut reports = Vec::with_capacity(records.len());
        for record in records {
            reports.push(self.apply(record.id).await?);
        }
        let changed = reports.iter().filter(|r| !r.changes.is_empty()).count();
        info!(replayed = reports.len(), changed, "Auto-apply replay complete");
        Ok(reports)
    }

    pub fn runtime_config(&self) -> Result<RuntimeConfig, VaultError> {
        let entries = self.store_lock()?.runtime_entries()?;
        Ok(RuntimeConfig::from_entries(entries))
    }

    /// Run one consolidation pass. A second concurrent pass is rejected.
    pub async fn consolidate(
        &self,
        policy: &ConsolidationConfig,
    ) -> Result<ConsolidationReport, VaultError> {
        if self
            .consolidating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Consolidation rejected: another pass is running");
            return Err(VaultError::ConsolidationConflict);
        }
        let _flag = ConsolidationFlag(&self.consolidating);
        let start = Instant::now();

        let gate = self.gate.write().await;
        let plan = {
            let mut sqlite = self.store_lock()?;
            let snapshot = sqlite.all_memories()?;
            let plan = consolidation::plan(&snapshot, policy, Utc::now());
            if !plan.is_empty() {
                sqlite.commit_consolidation(&plan.updates, &plan.deletions)?;
            }
            plan
        };
        let invalidated: Vec<Uuid> = plan
            .updates
            .iter()
            .map(|r| r.id)
            .chain(plan.deletions.iter().copied())
            .collect();
        self.hot.invalidate_all(invalidated).await;
        drop(gate);

        let mut report = plan.report;
        report.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            groups = report.groups,
            deduplicated = report.deduplicated,
            pruned = report.pruned,
            strengthened = report.strengthened,
            promoted = report.promoted,
            elapsed_ms = report.elapsed_ms,
            "Consolidation complete"
        );
        Ok(report)
    }

    /// Persist a synthesized decision.
    pub fn record_decision(&self, decision: &Decision) -> Result<(), VaultError> {
        if decision.symbol.trim().is_empty() {
            return Err(VaultError::Validation("decision symbol is empty".to_string()));
        }
        if decision.agent.trim().is_empty() {
            return Err(VaultError::Validation("decision agent is empty".to_string()));
        }
        self.store_lock()?.insert_decision(decision)
    }

    pub fn get_decision(&self, id: Uuid) -> Result<Option<Decision>, VaultError> {
        self.store_lock()?.get_decision(id)
    }

    pub fn recent_decisions(&self, limit: usize) -> Result<Vec<Decision>, VaultError> {
        self.store_lock()?.recent_decisions(limit)
    }

    pub fn decision_count(&self) -> Result<usize, VaultError> {
        self.store_lock()?.count_decisions()
    }

    /// Pending/applied counts and the intelligence score.
    pub fn summary(&self) -> Result<VaultSummary, VaultError> {
        let sqlite = self.store_lock()?;
        let total = sqlite.count_memories(None)?;
        let applied = sqlite.count_memories(Some(true))?;
        let now = Utc::now();
        let recent = sqlite.query_memories(
            &MemoryQuery {
                since: now.checked_sub_signed(self.intelligence_window),
                include_expired: true,
                ..MemoryQuery::default()
            },
            now,
        )?;
        drop(sqlite);

        let scores: Vec<u64> = recent
            .iter()
            .filter_map(|r| r.effectiveness_score)
            .map(|s| s.value() as u64)
            .collect();
        let intelligence_score = if scores.is_empty() {
            Score::ZERO
        } else {
            let mean = scores.iter().sum::<u64>() as f64 / scores.len() as f64;
            Score::clamped(mean.round() as i64)
        };

        Ok(VaultSummary {
            total,
            pending: total - applied,
            applied,
            intelligence_score,
        })
    }
}

/// Reject malformed records and normalize symbols in place.
fn validate_record(record: &mut MemoryRecord) -> Result<(), VaultError> {
    let invalid = |msg: &str| Err(VaultError::Validation(msg.to_string()));

    if record.title.trim().is_empty() {
        return invalid("title is empty");
    }
    if record.content.trim().is_empty() {
        return invalid("content is empty");
    }
    if record.source_agent.trim().is_empty() {
        return invalid("source_agent is empty");
    }
    if let (Some(from), Some(until)) = (record.valid_from, record.valid_until) {
        if from > until {
            return invalid("valid_from is after valid_until");
        }
    }

    record.related_symbols = record
        .related_symbols
        .iter()
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    match &record.effect {
        Some(MemoryEffect::SetParameter { name, .. }) if name.trim().is_empty() => {
            return invalid("parameter name is empty");
        }
        Some(MemoryEffect::WeightAgent {
            agent_id,
            multiplier,
        }) => {
            if agent_id.trim().is_empty() {
                return invalid("weighted agent id is empty");
            }
            if multiplier.is_sign_negative() {
                return invalid("agent multiplier must not be negative");
            }
            if *multiplier > MAX_AGENT_WEIGHT {
                return Err(VaultError::Validation(format!(
                    "agent multiplier {multiplier} exceeds {MAX_AGENT_WEIGHT}"
                )));
            }
        }
        Some(MemoryEffect::BlockAction { .. }) if record.related_symbols.is_empty() => {
            return invalid("block_action requires related symbols");
        }
        _ => {}
    }

    if record.outcome.is_some() && record.memory_type != MemoryType::TradeOutcome {
        return invalid("outcome marks are only valid on TRADE_OUTCOME memories");
    }
    if record.supersedes.is_some_and(|old| old == record.id) {
        return invalid("a memory cannot supersede itself");
    }
    Ok(())
}

fn ensure_absent(sqlite: &SqliteStore, id: Uuid) -> Result<(), VaultError> {
    if sqlite.contains_memory(id)? {
        return Err(VaultError::Validation(format!("memory {id} already exists")));
    }
    Ok(())
}

fn check_supersede(old: &MemoryRecord, new: &MemoryRecord) -> Result<(), VaultError> {
    if old.memory_type != new.memory_type || old.related_symbols != new.related_symbols {
        return Err(VaultError::Validation(format!(
            "memory {} can only be superseded by a record of the same type and symbols",
            old.id
        )));
    }
    if new.created_at < old.created_at {
        return Err(VaultError::Validation(format!(
            "superseding record is older than memory {}",
            old.id
        )));
    }
    Ok(())
}

/// Runtime entries written when a record is applied.
fn effect_entries(record: &MemoryRecord) -> Vec<(String, Decimal)> {
    match &record.effect {
        Some(MemoryEffect::SetParameter { name, value }) => {
            vec![(key_patterns::parameter(name), *value)]
        }
        Some(MemoryEffect::BlockAction { action }) => record
            .related_symbols
            .iter()
            .map(|symbol| (key_patterns::block(symbol, *action), Decimal::ONE))
            .collect(),
        Some(MemoryEffect::WeightAgent {
            agent_id,
            multiplier,
        }) => vec![(key_patterns::weight(agent_id), *multiplier)],
        None => vec![],
    }
}
