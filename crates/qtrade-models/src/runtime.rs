use std::collections::{BTreeMap, BTreeSet};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::trade_decision::Action;
use crate::vault_schema::key_patterns;

/// Largest vote multiplier an agent can carry.
pub const MAX_AGENT_WEIGHT: Decimal = Decimal::ONE_HUNDRED;

/// Snapshot of the runtime configuration that applied memories write to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    pub parameters: BTreeMap<String, Decimal>,
    /// Actions forbidden per symbol by applied risk rules.
    pub blocked: BTreeMap<String, BTreeSet<Action>>,
    /// Vote multipliers per agent id. Missing agents weigh 1.
    pub agent_weights: BTreeMap<String, Decimal>,
}

impl RuntimeConfig {
    /// Rebuild the snapshot from raw `runtime_parameters` rows.
    /// Unrecognized keys are ignored.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Decimal)>,
    {
        let mut config = RuntimeConfig::default();
        for (key, value) in entries {
            match key_patterns::parse(&key) {
                Some(key_patterns::RuntimeKey::Parameter(name)) => {
                    config.parameters.insert(name, value);
                }
                Some(key_patterns::RuntimeKey::Block { symbol, action }) => {
                    if !value.is_zero() {
                        config.blocked.entry(symbol).or_default().insert(action);
                    }
                }
                Some(key_patterns::RuntimeKey::Weight(agent_id)) => {
                    let weight = value.clamp(Decimal::ZERO, MAX_AGENT_WEIGHT);
                    config.agent_weights.insert(agent_id, weight);
                }
                None => {}
            }
        }
        config
    }

    pub fn agent_weight(&self, agent_id: &str) -> Decimal {
        self.agent_weights
            .get(agent_id)
            .copied()
            .unwrap_or(Decimal::ONE)
    }

    pub fn is_blocked(&self, symbol: &str, action: Action) -> bool {
        self.blocked
            .get(symbol)
            .is_some_and(|actions| actions.contains(&action))
    }

    pub fn parameter(&self, name: &str) -> Option<Decimal> {
        self.parameters.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn out_of_range_weights_are_clamped() {
        let config = RuntimeConfig::from_entries(vec![
            (key_patterns::weight("bull"), Decimal::MAX),
            (key_patterns::weight("bear"), dec!(-3)),
        ]);

        assert_eq!(config.agent_weight("bull"), MAX_AGENT_WEIGHT);
        assert_eq!(config.agent_weight("bear"), Decimal::ZERO);
    }

    #[test]
    fn builds_from_entries() {
        let config = RuntimeConfig::from_entries(vec![
            (key_patterns::parameter("max_position"), dec!(250)),
            (key_patterns::block("AAPL", Action::Buy), dec!(1)),
            (key_patterns::block("AAPL", Action::Sell), dec!(0)),
            (key_patterns::weight("trend"), dec!(0.5)),
            ("garbage".to_string(), dec!(7)),
        ]);

        assert_eq!(config.parameter("max_position"), Some(dec!(250)));
        assert!(config.is_blocked("AAPL", Action::Buy));
        assert!(!config.is_blocked("AAPL", Action::Sell));
        assert!(!config.is_blocked("TSLA", Action::Buy));
        assert_eq!(config.agent_weight("trend"), dec!(0.5));
        assert_eq!(config.agent_weight("unknown"), Decimal::ONE);
    }
}
