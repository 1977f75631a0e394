//! Host-state and agent-state vectors for one episode.

use indexmap::IndexMap;

use std::sync::Arc;

use crate::{Scenario, Side, SimError, SimResult};

/// Single source of truth for where every host and agent is right now.
///
/// Host entries are always members of the scenario's declared states, and the
/// agent map always has exactly the scenario's declared agents as keys.
#[derive(Debug, Clone)]
pub struct StateStore {
    scenario: Arc<Scenario>,
    hosts: Vec<String>,
    agents: IndexMap<Side, String>,
}

impl StateStore {
    pub fn new(scenario: Arc<Scenario>) -> Self {
        let mut store = Self {
            scenario,
            hosts: Vec::new(),
            agents: IndexMap::new(),
        };
        store.reset();
        store
    }

    pub fn scenario(&self) -> &Arc<Scenario> {
        &self.scenario
    }

    /// Restores declared initial host and agent states.
    pub fn reset(&mut self) -> Vec<String> {
        self.hosts = self.scenario.initial_host_states();
        self.agents = self
            .scenario
            .agents
            .iter()
            .map(|(side, decl)| (*side, decl.initial_state.clone()))
            .collect();
        self.hosts.clone()
    }

    pub fn num_hosts(&self) -> usize {
        self.hosts.len()
    }

    pub fn check_host(&self, host: usize) -> SimResult<()> {
        if host < self.hosts.len() {
            Ok(())
        } else {
            Err(SimError::InvalidArgument(format!(
                "invalid host index {host} (scenario has {} hosts)",
                self.hosts.len()
            )))
        }
    }

    pub fn host_state(&self, host: usize) -> SimResult<&str> {
        self.check_host(host)?;
        Ok(&self.hosts[host])
    }

    pub fn set_host_state(&mut self, host: usize, state: &str) -> SimResult<()> {
        self.check_host(host)?;
        if !self.scenario.is_valid_state(state) {
            return Err(SimError::InvalidArgument(format!(
                "state {state:?} is not declared by the scenario"
            )));
        }
        self.hosts[host] = state.to_string();
        Ok(())
    }

    pub fn host_states(&self) -> &[String] {
        &self.hosts
    }

    pub fn agent_state(&self, side: Side) -> SimResult<&str> {
        self.agents
            .get(&side)
            .map(String::as_str)
            .ok_or_else(|| undeclared_agent(side))
    }

    pub fn set_agent_state(&mut self, side: Side, state: &str) -> SimResult<()> {
        let slot = self.agents.get_mut(&side).ok_or_else(|| undeclared_agent(side))?;
        *slot = state.to_string();
        Ok(())
    }

    pub fn agent_states(&self) -> &IndexMap<Side, String> {
        &self.agents
    }

    /// Host labels in topology order, optionally followed by agent-state labels
    /// in agent declaration order.
    pub fn state_vector(&self, include_agents: bool) -> Vec<String> {
        let mut out = self.hosts.clone();
        if include_agents {
            out.extend(self.agents.values().cloned());
        }
        out
    }
}

fn undeclared_agent(side: Side) -> SimError {
    SimError::InvalidArgument(format!("agent {side} is not declared by the scenario"))
}
