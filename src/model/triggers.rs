//! Events that drive agent DFA updates, and the log of resulting agent-state changes.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

use crate::Side;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerEvent {
    /// Outcome of the agent's own action attempt.
    ActionResult { action: String, success: bool },
    /// Hosts whose state changed, keyed by host index.
    HostStateChange { changes: BTreeMap<usize, String> },
}

impl TriggerEvent {
    pub fn kind_name(&self) -> &'static str {
        match self {
            TriggerEvent::ActionResult { .. } => "action_result",
            TriggerEvent::HostStateChange { .. } => "host_state_change",
        }
    }

    pub fn host_changed(host: usize, state: impl Into<String>) -> Self {
        TriggerEvent::HostStateChange {
            changes: BTreeMap::from([(host, state.into())]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStateChange {
    pub agent: Side,
    pub from: String,
    pub to: String,
    /// Name of the rule that fired.
    pub rule: String,
    pub trigger: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentChangeLog {
    pub changes: Vec<AgentStateChange>,
}

impl AgentChangeLog {
    pub fn extend(&mut self, changes: impl IntoIterator<Item = AgentStateChange>) {
        self.changes.extend(changes);
    }

    pub fn clear(&mut self) {
        self.changes.clear();
    }
}
