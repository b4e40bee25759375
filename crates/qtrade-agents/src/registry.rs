use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use qtrade_models::agent_message::AgentStatus;
use qtrade_models::state::AgentCounts;

use crate::agent::Agent;
use crate::error::AgentError;

struct Registered {
    agent: Arc<dyn Agent>,
    tier: u8,
}

/// Agents keyed by id, each assigned to one tier, plus their live status.
///
/// Registration happens before the registry is shared; statuses are updated
/// concurrently by tier executors.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Registered>,
    /// Registration order, which is also the order within a tier.
    order: Vec<String>,
    statuses: Mutex<HashMap<String, AgentStatus>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tier: u8, agent: Arc<dyn Agent>) -> Result<(), AgentError> {
        let id = agent.id().to_string();
        if id.trim().is_empty() {
            return Err(AgentError::Registration("agent id is empty".to_string()));
        }
        if tier == 0 {
            return Err(AgentError::Registration(format!(
                "agent {id}: tiers are numbered from 1"
            )));
        }
        if self.agents.contains_key(&id) {
            return Err(AgentError::Registration(format!(
                "agent {id} is already registered"
            )));
        }

        self.statuses().insert(id.clone(), AgentStatus::Idle);
        self.order.push(id.clone());
        self.agents.insert(id, Registered { agent, tier });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(id).map(|r| Arc::clone(&r.agent))
    }

    pub fn tier_of(&self, id: &str) -> Option<u8> {
        self.agents.get(id).map(|r| r.tier)
    }

    /// Agent ids grouped by tier, tiers ascending.
    pub fn tier_plan(&self) -> BTreeMap<u8, Vec<String>> {
        let mut plan: BTreeMap<u8, Vec<String>> = BTreeMap::new();
        for id in &self.order {
            if let Some(registered) = self.agents.get(id) {
                plan.entry(registered.tier).or_default().push(id.clone());
            }
        }
        plan
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    fn statuses(&self) -> MutexGuard<'_, HashMap<String, AgentStatus>> {
        // Status bookkeeping stays usable even if a holder panicked.
        self.statuses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_status(&self, id: &str, status: AgentStatus) {
        if let Some(current) = self.statuses().get_mut(id) {
            *current = status;
        }
    }

    pub fn status(&self, id: &str) -> Option<AgentStatus> {
        self.statuses().get(id).copied()
    }

    pub fn counts(&self) -> AgentCounts {
        AgentCounts::from_statuses(self.statuses().values().copied())
    }
}
