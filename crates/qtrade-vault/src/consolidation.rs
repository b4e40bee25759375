//! Consolidation planning: deduplicate, prune and strengthen a vault snapshot.
//!
//! Planning is pure over a snapshot of records; the vault commits the
//! resulting plan in a single transaction.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Duration, Utc};
use qtrade_models::config::ConsolidationConfig;
use qtrade_models::memory::{ConsolidationReport, MemoryRecord, MemoryType};
use qtrade_models::score::Score;
use uuid::Uuid;

/// Effectiveness assumed for a TRADE_OUTCOME that is strengthened before
/// ever being scored.
const BASELINE_EFFECTIVENESS: u8 = 50;

#[derive(Debug, Clone, Default)]
pub struct ConsolidationPlan {
    pub updates: Vec<MemoryRecord>,
    pub deletions: Vec<Uuid>,
    pub report: ConsolidationReport,
}

impl ConsolidationPlan {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.deletions.is_empty()
    }
}

/// Lower-cased alphanumeric word set of a memory's title and content.
pub fn tokenize(record: &MemoryRecord) -> HashSet<String> {
    format!("{} {}", record.title, record.content)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Jaccard similarity of two token sets. Two empty sets are identical.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

pub fn plan(
    records: &[MemoryRecord],
    policy: &ConsolidationConfig,
    now: DateTime<Utc>,
) -> ConsolidationPlan {
    let mut working: BTreeMap<Uuid, MemoryRecord> =
        records.iter().map(|r| (r.id, r.clone())).collect();
    let mut modified: BTreeSet<Uuid> = BTreeSet::new();
    let mut deleted: BTreeSet<Uuid> = BTreeSet::new();
    let mut report = ConsolidationReport::default();

    // 1. Group active records by (type, symbols), oldest first.
    let mut groups: BTreeMap<(MemoryType, Vec<String>), Vec<&MemoryRecord>> = BTreeMap::new();
    for record in records.iter().filter(|r| !r.is_expired_at(now)) {
        let symbols: Vec<String> = record.related_symbols.iter().cloned().collect();
        groups
            .entry((record.memory_type, symbols))
            .or_default()
            .push(record);
    }
    report.groups = groups.len();

    // 2. Merge near-duplicates into the oldest record of each cluster.
    for members in groups.values_mut() {
        members.sort_by_key(|r| r.created_at);
        let tokens: Vec<HashSet<String>> = members.iter().map(|r| tokenize(r)).collect();

        for i in 0..members.len() {
            let keeper_id = members[i].id;
            if deleted.contains(&keeper_id) {
                continue;
            }
            for j in (i + 1)..members.len() {
                let candidate = members[j];
                if deleted.contains(&candidate.id) || candidate.is_protected() {
                    continue;
                }
                if jaccard(&tokens[i], &tokens[j]) < policy.similarity_threshold {
                    continue;
                }
                if let Some(keeper) = working.get_mut(&keeper_id) {
                    merge_into(keeper, candidate);
                }
                modified.insert(keeper_id);
                deleted.insert(candidate.id);
                report.deduplicated += 1;
            }
        }
    }

    // 3. Prune expired low-value records.
    // An out-of-range grace period never elapses.
    let grace = Duration::try_hours(policy.grace_period_hours.max(0));
    for record in working.values() {
        if deleted.contains(&record.id) || record.is_protected() {
            continue;
        }
        let Some(valid_until) = record.valid_until else {
            continue;
        };
        if valid_until >= now {
            continue;
        }
        let prune = match record.effectiveness_score {
            Some(score) => score.value() < policy.low_value_threshold,
            None => grace
                .and_then(|grace| valid_until.checked_add_signed(grace))
                .is_some_and(|deadline| deadline < now),
        };
        if prune {
            deleted.insert(record.id);
            report.pruned += 1;
        }
    }

    // 4. Strengthen trade outcomes confirmed by later positive outcomes.
    let outcomes: Vec<MemoryRecord> = records
        .iter()
        .filter(|r| r.memory_type == MemoryType::TradeOutcome && r.outcome.is_some())
        .cloned()
        .collect();
    for target in &outcomes {
        if deleted.contains(&target.id) {
            continue;
        }
        let Some(mark) = target.outcome else {
            continue;
        };
        let watermark = target
            .last_strengthened
            .unwrap_or(target.created_at)
            .max(target.created_at);
        let confirmations: Vec<DateTime<Utc>> = outcomes
            .iter()
            .filter(|other| other.id != target.id)
            .filter(|other| other.related_symbols == target.related_symbols)
            .filter(|other| {
                other
                    .outcome
                    .is_some_and(|o| o.positive && o.action == mark.action)
            })
            .map(|other| other.created_at)
            .filter(|created| *created > watermark)
            .collect();
        if confirmations.len() < policy.min_confirmations.max(1) {
            continue;
        }

        let Some(record) = working.get_mut(&target.id) else {
            continue;
        };
        let base = record
            .effectiveness_score
            .unwrap_or(Score::clamped(BASELINE_EFFECTIVENESS as i64));
        record.effectiveness_score = Some(base.saturating_add(policy.strengthen_step));
        record.last_strengthened = confirmations.iter().max().copied();
        report.strengthened += 1;
        if policy.promote_on_strengthen {
            let promoted = record.priority.promote();
            if promoted != record.priority {
                record.priority = promoted;
                report.promoted += 1;
            }
        }
        modified.insert(target.id);
    }

    let updates = modified
        .iter()
        .filter(|id| !deleted.contains(id))
        .filter_map(|id| working.get(id).cloned())
        .collect();

    ConsolidationPlan {
        updates,
        deletions: deleted.into_iter().collect(),
        report,
    }
}

fn merge_into(keeper: &mut MemoryRecord, duplicate: &MemoryRecord) {
    keeper.priority = keeper.priority.max(duplicate.priority);
    keeper
        .related_symbols
        .extend(duplicate.related_symbols.iter().cloned());
    keeper.effectiveness_score = match (keeper.effectiveness_score, duplicate.effectiveness_score) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    keeper.valid_until = match (keeper.valid_until, duplicate.valid_until) {
        (Some(a), Some(b)) => Some(a.max(b)),
        _ => None,
    };
    if duplicate.applied && duplicate.effect == keeper.effect {
        keeper.applied = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qtrade_models::memory::{OutcomeMark, Priority};
    use qtrade_models::trade_decision::Action;

    fn record(memory_type: MemoryType, title: &str, content: &str, age_hours: i64) -> MemoryRecord {
        let mut record = MemoryRecord::new(memory_type, title, content, "test")
            .with_symbols(["AAPL"]);
        record.id = Uuid::new_v4();
        record.created_at = Utc::now() - Duration::hours(age_hours);
        record
    }

    fn outcome(action: Action, positive: bool, age_hours: i64) -> MemoryRecord {
        let mut r = record(
            MemoryType::TradeOutcome,
            "AAPL outcome",
            &format!("{action} closed positive={positive}"),
            age_hours,
        );
        r.outcome = Some(OutcomeMark { action, positive });
        r
    }

    #[test]
    fn jaccard_similarity() {
        let a = tokenize(&record(MemoryType::Learning, "Gap fill", "gaps fill by noon", 0));
        let b = tokenize(&record(MemoryType::Learning, "gap FILL", "Gaps fill by noon!", 0));
        let c = tokenize(&record(MemoryType::Learning, "volume", "spikes fade", 0));
        assert_eq!(jaccard(&a, &b), 1.0);
        assert_eq!(jaccard(&a, &c), 0.0);
    }

    #[test]
    fn merges_near_duplicates_into_oldest() {
        let oldest = record(MemoryType::Learning, "Gap fill", "gaps fill by noon", 5);
        let mut newer = record(MemoryType::Learning, "gap fill", "Gaps fill by noon", 1);
        newer.priority = Priority::High;
        newer.effectiveness_score = Some(Score::new(70).unwrap());
        let unrelated = record(MemoryType::Learning, "Volume", "spikes fade at open", 2);

        let plan = plan(
            &[oldest.clone(), newer.clone(), unrelated],
            &ConsolidationConfig::default(),
            Utc::now(),
        );

        assert_eq!(plan.report.deduplicated, 1);
        assert_eq!(plan.deletions, vec![newer.id]);
        assert_eq!(plan.updates.len(), 1);
        let merged = &plan.updates[0];
        assert_eq!(merged.id, oldest.id);
        assert_eq!(merged.priority, Priority::High);
        assert_eq!(merged.effectiveness_score, Some(Score::new(70).unwrap()));
    }

    #[test]
    fn different_symbols_are_not_merged() {
        let a = record(MemoryType::Learning, "Gap fill", "gaps fill by noon", 5);
        let b = record(MemoryType::Learning, "Gap fill", "gaps fill by noon", 1).with_symbols(["TSLA"]);

        let plan = plan(&[a, b], &ConsolidationConfig::default(), Utc::now());
        assert_eq!(plan.report.deduplicated, 0);
        assert_eq!(plan.report.groups, 2);
    }

    #[test]
    fn prunes_expired_low_value_and_stale_unscored() {
        let now = Utc::now();
        let mut low = record(MemoryType::Learning, "low", "weak signal", 10);
        low.valid_until = Some(now - Duration::hours(1));
        low.effectiveness_score = Some(Score::new(10).unwrap());

        let mut valuable = record(MemoryType::Learning, "valuable", "keeps paying", 10);
        valuable.valid_until = Some(now - Duration::hours(1));
        valuable.effectiveness_score = Some(Score::new(90).unwrap());

        let mut fresh_unscored = record(MemoryType::Learning, "fresh", "just expired", 10);
        fresh_unscored.valid_until = Some(now - Duration::hours(1));

        let mut stale_unscored = record(MemoryType::Learning, "stale", "long expired", 200);
        stale_unscored.valid_until = Some(now - Duration::hours(100));

        let plan = plan(
            &[low.clone(), valuable, fresh_unscored, stale_unscored.clone()],
            &ConsolidationConfig::default(),
            now,
        );

        assert_eq!(plan.report.pruned, 2);
        assert!(plan.deletions.contains(&low.id));
        assert!(plan.deletions.contains(&stale_unscored.id));
    }

    #[test]
    fn oversized_grace_period_keeps_unscored_records() {
        let now = Utc::now();
        let mut stale = record(MemoryType::Learning, "stale", "long expired", 200);
        stale.valid_until = Some(now - Duration::hours(100));
        let policy = ConsolidationConfig {
            grace_period_hours: i64::MAX,
            ..ConsolidationConfig::default()
        };

        let plan = plan(&[stale], &policy, now);
        assert_eq!(plan.report.pruned, 0);
    }

    #[test]
    fn never_removes_critical_risk_rules() {
        let now = Utc::now();
        let mut rule = record(MemoryType::RiskRule, "No AAPL longs", "block buys", 500);
        rule.priority = Priority::Critical;
        rule.valid_until = Some(now - Duration::hours(400));
        rule.effectiveness_score = Some(Score::ZERO);
        let mut twin = record(MemoryType::RiskRule, "No AAPL longs", "block buys", 1);
        twin.priority = Priority::Critical;

        let plan = plan(&[rule, twin], &ConsolidationConfig::default(), now);
        assert!(plan.deletions.is_empty());
        assert_eq!(plan.report.pruned, 0);
        assert_eq!(plan.report.deduplicated, 0);
    }

    #[test]
    fn strengthens_confirmed_trade_outcomes_once() {
        let target = outcome(Action::Buy, true, 10);
        let confirm_a = outcome(Action::Buy, true, 5);
        let confirm_b = outcome(Action::Buy, true, 3);
        let policy = ConsolidationConfig {
            similarity_threshold: 1.1,
            ..ConsolidationConfig::default()
        };
        let snapshot = vec![target.clone(), confirm_a, confirm_b];

        let first = plan(&snapshot, &policy, Utc::now());
        let strengthened = first
            .updates
            .iter()
            .find(|r| r.id == target.id)
            .expect("target strengthened");
        assert_eq!(strengthened.effectiveness_score, Some(Score::new(60).unwrap()));
        assert_eq!(strengthened.priority, Priority::High);
        assert!(first.report.promoted >= 1);

        // Re-running over the committed state must not count the same evidence twice.
        let mut committed = snapshot.clone();
        for update in &first.updates {
            if let Some(slot) = committed.iter_mut().find(|r| r.id == update.id) {
                *slot = update.clone();
            }
        }
        let second = plan(&committed, &policy, Utc::now());
        assert!(second.updates.iter().all(|r| r.id != target.id));
    }

    #[test]
    fn negative_or_other_action_outcomes_do_not_confirm() {
        let target = outcome(Action::Buy, true, 10);
        let loss = outcome(Action::Buy, false, 5);
        let sell = outcome(Action::Sell, true, 3);
        let policy = ConsolidationConfig {
            similarity_threshold: 1.1,
            ..ConsolidationConfig::default()
        };

        let plan = plan(&[target, loss, sell], &policy, Utc::now());
        assert_eq!(plan.report.strengthened, 0);
    }

    #[test]
    fn strengthening_is_bounded() {
        let mut target = outcome(Action::Sell, true, 10);
        target.effectiveness_score = Some(Score::new(95).unwrap());
        let policy = ConsolidationConfig {
            similarity_threshold: 1.1,
            min_confirmations: 1,
            ..ConsolidationConfig::default()
        };

        let plan = plan(&[target.clone(), outcome(Action::Sell, true, 1)], &policy, Utc::now());
        let updated = plan.updates.iter().find(|r| r.id == target.id).unwrap();
        assert_eq!(updated.effectiveness_score, Some(Score::MAX));
    }
}
