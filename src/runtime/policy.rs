//! Agent policies: the scenario-driven DFA interpreter and fixed reference policies.

use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore as _, SeedableRng as _};
use serde::{Deserialize, Serialize};

use crate::{Scenario, Side, StateStore};

/// Host index reported for actions that take no target.
pub const HOSTLESS_PLACEHOLDER: usize = 0;

/// Read-only view of the live episode handed to a policy.
#[derive(Debug, Clone, Copy)]
pub struct PolicyView<'a> {
    pub scenario: &'a Scenario,
    pub store: &'a StateStore,
    pub side: Side,
    pub step: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyChoice {
    pub action: String,
    pub host: usize,
}

impl PolicyChoice {
    pub fn idle(scenario: &Scenario, side: Side) -> Self {
        Self {
            action: scenario.idle_action(side).to_string(),
            host: HOSTLESS_PLACEHOLDER,
        }
    }
}

pub trait Policy {
    fn name(&self) -> &str;

    fn choose(&mut self, view: &PolicyView<'_>) -> PolicyChoice;

    /// When moving second in a step, choose against the world left by the
    /// first mover's action instead of the pre-step world.
    fn reacts_within_step(&self) -> bool {
        false
    }
}

/// Reads the agent's declared DFA: the first transition leaving the current
/// agent state names the action and its target host.
#[derive(Debug, Clone, Default)]
pub struct DfaPolicy;

impl Policy for DfaPolicy {
    fn name(&self) -> &str {
        "dfa"
    }

    fn choose(&mut self, view: &PolicyView<'_>) -> PolicyChoice {
        let scenario = view.scenario;
        let Some(agent) = scenario.agent(view.side) else {
            return PolicyChoice::idle(scenario, view.side);
        };
        let Ok(current) = view.store.agent_state(view.side) else {
            return PolicyChoice::idle(scenario, view.side);
        };

        for transition in agent.transitions.values() {
            if transition.from_state != current || transition.action.is_empty() {
                continue;
            }
            let host = match &transition.target_host {
                Some(host) => match host.resolve(scenario.host_names()) {
                    Some(idx) => idx,
                    None => continue,
                },
                None if agent
                    .actions
                    .get(&transition.action)
                    .is_some_and(|rule| rule.hostless) =>
                {
                    HOSTLESS_PLACEHOLDER
                }
                // a targeted action without a target cannot be taken
                None => continue,
            };
            return PolicyChoice {
                action: transition.action.clone(),
                host,
            };
        }
        PolicyChoice::idle(scenario, view.side)
    }
}

/// Always idles.
#[derive(Debug, Clone, Default)]
pub struct SleepPolicy;

impl Policy for SleepPolicy {
    fn name(&self) -> &str {
        "sleep"
    }

    fn choose(&mut self, view: &PolicyView<'_>) -> PolicyChoice {
        PolicyChoice::idle(view.scenario, view.side)
    }
}

/// Uniformly random declared action on a uniformly random host. Seeded, so a
/// given seed always replays the same choices.
#[derive(Debug)]
pub struct RandomPolicy {
    rng: ChaCha20Rng,
}

impl RandomPolicy {
    pub fn new(seed: u64) -> Self {
        let seed_bytes = blake3::hash(&seed.to_le_bytes()).as_bytes().to_owned();
        let mut seed32 = [0u8; 32];
        seed32.copy_from_slice(&seed_bytes[..32]);
        Self {
            rng: ChaCha20Rng::from_seed(seed32),
        }
    }

    fn pick(&mut self, len: usize) -> usize {
        (self.rng.next_u64() % len as u64) as usize
    }
}

impl Policy for RandomPolicy {
    fn name(&self) -> &str {
        "random"
    }

    fn choose(&mut self, view: &PolicyView<'_>) -> PolicyChoice {
        let actions: Vec<&String> = view
            .scenario
            .agent(view.side)
            .map(|a| a.actions.keys().collect())
            .unwrap_or_default();
        if actions.is_empty() || view.store.num_hosts() == 0 {
            return PolicyChoice::idle(view.scenario, view.side);
        }
        let action = actions[self.pick(actions.len())].clone();
        let host = self.pick(view.store.num_hosts());
        PolicyChoice { action, host }
    }
}

/// Systematic attacker: works through `(host_state, action)` stages in
/// priority order, hitting the first host found in the highest stage.
#[derive(Debug, Clone)]
pub struct KillchainPolicy {
    stages: Vec<(String, String)>,
}

impl KillchainPolicy {
    pub fn new(stages: Vec<(String, String)>) -> Self {
        Self { stages }
    }
}

impl Default for KillchainPolicy {
    fn default() -> Self {
        Self::new(
            [
                ("q3", "Impact"),
                ("q2", "PrivilegeEscalate"),
                ("q1", "ExploitRemoteService"),
                ("q0", "DiscoverNetworkServices"),
            ]
            .into_iter()
            .map(|(s, a)| (s.to_string(), a.to_string()))
            .collect(),
        )
    }
}

impl Policy for KillchainPolicy {
    fn name(&self) -> &str {
        "killchain"
    }

    fn reacts_within_step(&self) -> bool {
        true
    }

    fn choose(&mut self, view: &PolicyView<'_>) -> PolicyChoice {
        let hosts = view.store.host_states();
        for (state, action) in &self.stages {
            if let Some(host) = hosts.iter().position(|s| s == state) {
                return PolicyChoice {
                    action: action.clone(),
                    host,
                };
            }
        }
        match self.stages.first() {
            Some((_, action)) => PolicyChoice {
                action: action.clone(),
                host: HOSTLESS_PLACEHOLDER,
            },
            None => PolicyChoice::idle(view.scenario, view.side),
        }
    }
}

/// Defender that remediates the most compromised host once its rank reaches
/// `threshold`; idles otherwise. Ties go to the lowest host index.
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    name: &'static str,
    ranking: Vec<String>,
    threshold: usize,
    action: String,
}

impl ThresholdPolicy {
    pub fn new(
        name: &'static str,
        ranking: Vec<String>,
        threshold: usize,
        action: impl Into<String>,
    ) -> Self {
        Self {
            name,
            ranking,
            threshold,
            action: action.into(),
        }
    }

    /// Removes threats once a host is exploited (`q2`) or worse.
    pub fn reactive() -> Self {
        Self::new("reactive", default_ranking(), 2, "Remove")
    }

    /// Removes anything that left the secure state.
    pub fn proactive() -> Self {
        Self::new("proactive", default_ranking(), 1, "Remove")
    }

    fn rank(&self, state: &str) -> usize {
        self.ranking.iter().position(|s| s == state).unwrap_or(0)
    }
}

fn default_ranking() -> Vec<String> {
    ["q0", "q1", "q2", "q3"].iter().map(|s| s.to_string()).collect()
}

impl Policy for ThresholdPolicy {
    fn name(&self) -> &str {
        self.name
    }

    fn reacts_within_step(&self) -> bool {
        true
    }

    fn choose(&mut self, view: &PolicyView<'_>) -> PolicyChoice {
        let mut worst: Option<(usize, usize)> = None;
        for (host, state) in view.store.host_states().iter().enumerate() {
            let rank = self.rank(state);
            if rank < self.threshold {
                continue;
            }
            if worst.is_none_or(|(_, best)| rank > best) {
                worst = Some((host, rank));
            }
        }
        match worst {
            Some((host, _)) => PolicyChoice {
                action: self.action.clone(),
                host,
            },
            None => PolicyChoice::idle(view.scenario, view.side),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Dfa,
    Sleep,
    Random,
    Killchain,
    Reactive,
    Proactive,
}

impl clap::ValueEnum for PolicyKind {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            Self::Dfa,
            Self::Sleep,
            Self::Random,
            Self::Killchain,
            Self::Reactive,
            Self::Proactive,
        ]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()).help(self.describe()))
    }
}

impl PolicyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dfa => "dfa",
            Self::Sleep => "sleep",
            Self::Random => "random",
            Self::Killchain => "killchain",
            Self::Reactive => "reactive",
            Self::Proactive => "proactive",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Dfa => "follows the agent DFA declared in the scenario",
            Self::Sleep => "always takes the agent's idle action",
            Self::Random => "random declared action on a random host (seeded)",
            Self::Killchain => "discover, exploit, escalate, then impact, most advanced host first",
            Self::Reactive => "removes hosts that reached q2 or worse",
            Self::Proactive => "removes any host that left q0",
        }
    }

    pub fn build(self, seed: u64) -> Box<dyn Policy> {
        match self {
            Self::Dfa => Box::new(DfaPolicy),
            Self::Sleep => Box::new(SleepPolicy),
            Self::Random => Box::new(RandomPolicy::new(seed)),
            Self::Killchain => Box::new(KillchainPolicy::default()),
            Self::Reactive => Box::new(ThresholdPolicy::reactive()),
            Self::Proactive => Box::new(ThresholdPolicy::proactive()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyCatalogEntry {
    pub name: String,
    pub description: String,
}

pub fn policy_catalog() -> Vec<PolicyCatalogEntry> {
    <PolicyKind as clap::ValueEnum>::value_variants()
        .iter()
        .map(|k| PolicyCatalogEntry {
            name: k.as_str().to_string(),
            description: k.describe().to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const DOC: &str = r#"
topology: {hosts: [web, db, mail]}
states: [q0, q1, q2, q3]
agents:
  Red:
    initial_state: p0
    actions:
      Scan: {from_state: q0, to_state: q1}
      Exploit: {from_state: q1, to_state: q2}
      Wait: {from_state: any, to_state: same, hostless: true}
    transitions:
      untargeted: {from_state: p0, action: Exploit}
      scan: {from_state: p0, action: Scan, target_host: db}
      rest: {from_state: p1, action: Wait}
  Blue:
    initial_state: b0
    idle_action: Watch
"#;

    fn store() -> StateStore {
        StateStore::new(Arc::new(Scenario::from_yaml_str(DOC).expect("parse")))
    }

    fn choose(policy: &mut dyn Policy, store: &StateStore, side: Side) -> PolicyChoice {
        let view = PolicyView {
            scenario: store.scenario(),
            store,
            side,
            step: 0,
        };
        policy.choose(&view)
    }

    #[test]
    fn dfa_policy_skips_transitions_without_a_usable_target() {
        let s = store();
        let choice = choose(&mut DfaPolicy, &s, Side::Red);
        assert_eq!(
            choice,
            PolicyChoice {
                action: "Scan".to_string(),
                host: 1
            }
        );
    }

    #[test]
    fn dfa_policy_uses_placeholder_for_hostless_actions() {
        let mut s = store();
        s.set_agent_state(Side::Red, "p1").expect("set");
        let choice = choose(&mut DfaPolicy, &s, Side::Red);
        assert_eq!(choice.action, "Wait");
        assert_eq!(choice.host, HOSTLESS_PLACEHOLDER);
    }

    #[test]
    fn dfa_policy_falls_back_to_declared_idle_action() {
        let mut s = store();
        s.set_agent_state(Side::Red, "p7").expect("set");
        assert_eq!(choose(&mut DfaPolicy, &s, Side::Red).action, "Sleep");
        assert_eq!(choose(&mut DfaPolicy, &s, Side::Blue).action, "Watch");
    }

    #[test]
    fn random_policy_is_reproducible_for_a_seed() {
        let s = store();
        let mut a = RandomPolicy::new(42);
        let mut b = RandomPolicy::new(42);
        for _ in 0..16 {
            let ca = choose(&mut a, &s, Side::Red);
            let cb = choose(&mut b, &s, Side::Red);
            assert_eq!(ca, cb);
            assert!(ca.host < 3);
            assert!(["Scan", "Exploit", "Wait"].contains(&ca.action.as_str()));
        }
    }

    #[test]
    fn killchain_prefers_most_advanced_stage() {
        let mut s = store();
        let mut policy = KillchainPolicy::default();
        assert_eq!(
            choose(&mut policy, &s, Side::Red).action,
            "DiscoverNetworkServices"
        );
        s.set_host_state(2, "q2").expect("set");
        s.set_host_state(1, "q1").expect("set");
        let choice = choose(&mut policy, &s, Side::Red);
        assert_eq!(choice.action, "PrivilegeEscalate");
        assert_eq!(choice.host, 2);
    }

    #[test]
    fn threshold_policies_pick_worst_host_or_idle() {
        let mut s = store();
        let mut reactive = ThresholdPolicy::reactive();
        let mut proactive = ThresholdPolicy::proactive();
        s.set_host_state(1, "q1").expect("set");
        assert_eq!(choose(&mut reactive, &s, Side::Blue).action, "Watch");
        let choice = choose(&mut proactive, &s, Side::Blue);
        assert_eq!((choice.action.as_str(), choice.host), ("Remove", 1));

        s.set_host_state(0, "q3").expect("set");
        s.set_host_state(2, "q3").expect("set");
        let choice = choose(&mut reactive, &s, Side::Blue);
        assert_eq!((choice.action.as_str(), choice.host), ("Remove", 0));
    }

    #[test]
    fn catalog_lists_every_kind() {
        let names: Vec<String> = policy_catalog().into_iter().map(|e| e.name).collect();
        assert_eq!(
            names,
            vec!["dfa", "sleep", "random", "killchain", "reactive", "proactive"]
        );
    }
}
