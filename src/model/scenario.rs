//! Scenario descriptor parsing: topology, host states, and per-agent rule tables.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::{SimError, SimResult};

pub const ANY_STATE: &str = "any";
pub const SAME_STATE: &str = "same";
pub const DEFAULT_KEY: &str = "default";

const DEFAULT_AGENT_STATE: &str = "p0";
const DEFAULT_HOST_STATE: &str = "q0";

#[derive(Debug, Clone)]
pub struct ScenarioPath {
    path: PathBuf,
}

impl ScenarioPath {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }
}

/// The two competing agents. Red always opens an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    Red,
    Blue,
}

impl Side {
    pub const ALL: [Side; 2] = [Side::Red, Side::Blue];

    pub fn name(self) -> &'static str {
        match self {
            Side::Red => "Red",
            Side::Blue => "Blue",
        }
    }

    pub fn opponent(self) -> Side {
        match self {
            Side::Red => Side::Blue,
            Side::Blue => Side::Red,
        }
    }

    /// Idle action used when the scenario does not declare one.
    pub fn default_idle_action(self) -> &'static str {
        match self {
            Side::Red => "Sleep",
            Side::Blue => "NoOp",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Side {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Red" | "red" | "R" => Ok(Side::Red),
            "Blue" | "blue" | "B" => Ok(Side::Blue),
            other => Err(SimError::InvalidArgument(format!(
                "unknown agent {other:?} (expected Red or Blue)"
            ))),
        }
    }
}

/// Source-state precondition of a rule: either `any` or one exact label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StateGuard {
    Any,
    Exact(String),
}

impl StateGuard {
    pub fn admits(&self, state: &str) -> bool {
        match self {
            StateGuard::Any => true,
            StateGuard::Exact(label) => label == state,
        }
    }
}

impl From<String> for StateGuard {
    fn from(value: String) -> Self {
        if value == ANY_STATE {
            StateGuard::Any
        } else {
            StateGuard::Exact(value)
        }
    }
}

impl From<StateGuard> for String {
    fn from(value: StateGuard) -> Self {
        match value {
            StateGuard::Any => ANY_STATE.to_string(),
            StateGuard::Exact(label) => label,
        }
    }
}

/// Resulting host state of an action rule.
///
/// In the document this is either the `same` sentinel, a plain label, or a
/// mapping from source state to target state with an optional `default` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawToState", into = "RawToState")]
pub enum ToState {
    Same,
    Fixed(String),
    Conditional {
        map: IndexMap<String, String>,
        default: Option<String>,
    },
}

impl ToState {
    /// Computes the target state for `source`. Pure: identical inputs always
    /// yield the identical target.
    pub fn resolve<'a>(&'a self, source: &'a str) -> &'a str {
        match self {
            ToState::Same => source,
            ToState::Fixed(label) => label,
            ToState::Conditional { map, default } => map
                .get(source)
                .or(default.as_ref())
                .map(String::as_str)
                .unwrap_or(source),
        }
    }

    /// Every label this rule can produce besides the identity fallback.
    pub fn declared_targets(&self) -> Vec<&str> {
        match self {
            ToState::Same => Vec::new(),
            ToState::Fixed(label) => vec![label.as_str()],
            ToState::Conditional { map, default } => map
                .values()
                .chain(default.iter())
                .map(String::as_str)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawToState {
    Label(String),
    Mapping(IndexMap<String, String>),
}

impl From<RawToState> for ToState {
    fn from(raw: RawToState) -> Self {
        match raw {
            RawToState::Label(label) if label == SAME_STATE => ToState::Same,
            RawToState::Label(label) => ToState::Fixed(label),
            RawToState::Mapping(mut map) => {
                let default = map.shift_remove(DEFAULT_KEY);
                ToState::Conditional { map, default }
            }
        }
    }
}

impl From<ToState> for RawToState {
    fn from(value: ToState) -> Self {
        match value {
            ToState::Same => RawToState::Label(SAME_STATE.to_string()),
            ToState::Fixed(label) => RawToState::Label(label),
            ToState::Conditional { mut map, default } => {
                if let Some(default) = default {
                    map.insert(DEFAULT_KEY.to_string(), default);
                }
                RawToState::Mapping(map)
            }
        }
    }
}

/// Host reference used by DFA transitions and `specific_host` conditions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HostRef {
    Index(usize),
    Name(String),
}

impl HostRef {
    pub fn resolve(&self, hosts: &[String]) -> Option<usize> {
        match self {
            HostRef::Index(i) if *i < hosts.len() => Some(*i),
            HostRef::Index(_) => None,
            HostRef::Name(name) => hosts.iter().position(|h| h == name),
        }
    }
}

impl fmt::Display for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostRef::Index(i) => write!(f, "{i}"),
            HostRef::Name(name) => write!(f, "{name:?}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRule {
    pub from_state: StateGuard,
    pub to_state: ToState,
    #[serde(default)]
    pub reward: f64,
    /// The action needs no target host (e.g. an idle action).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hostless: bool,
}

/// Agent-state transition triggered by the outcome of the agent's own action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DfaTransition {
    pub from_state: String,
    pub action: String,
    #[serde(default)]
    pub on_success: Option<String>,
    #[serde(default)]
    pub on_failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_host: Option<HostRef>,
}

impl DfaTransition {
    /// Target for the given outcome; an empty label counts as absent.
    pub fn target_for(&self, success: bool) -> Option<&str> {
        let target = if success {
            self.on_success.as_deref()
        } else {
            self.on_failure.as_deref()
        };
        target.filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TriggerKind {
    HostStateChange,
    Other(String),
}

impl TriggerKind {
    pub fn as_str(&self) -> &str {
        match self {
            TriggerKind::HostStateChange => "host_state_change",
            TriggerKind::Other(s) => s,
        }
    }
}

impl From<String> for TriggerKind {
    fn from(value: String) -> Self {
        if value == "host_state_change" {
            TriggerKind::HostStateChange
        } else {
            TriggerKind::Other(value)
        }
    }
}

impl From<TriggerKind> for String {
    fn from(value: TriggerKind) -> Self {
        value.as_str().to_string()
    }
}

/// Predicate over the hosts changed by one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCondition", into = "RawCondition")]
pub enum Condition {
    AnyHostInStates { states: Vec<String> },
    AllHostsInStates { states: Vec<String> },
    SpecificHost { host: HostRef, state: String },
    /// Kept so newer documents still load; never satisfied.
    Unknown { kind: String },
}

impl Condition {
    pub fn kind_name(&self) -> &str {
        match self {
            Condition::AnyHostInStates { .. } => "any_host_in_states",
            Condition::AllHostsInStates { .. } => "all_hosts_in_states",
            Condition::SpecificHost { .. } => "specific_host",
            Condition::Unknown { kind } => kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCondition {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    states: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    host_id: Option<HostRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state: Option<String>,
}

impl TryFrom<RawCondition> for Condition {
    type Error = String;

    fn try_from(raw: RawCondition) -> Result<Self, Self::Error> {
        match raw.kind.as_str() {
            "any_host_in_states" => Ok(Condition::AnyHostInStates { states: raw.states }),
            "all_hosts_in_states" => Ok(Condition::AllHostsInStates { states: raw.states }),
            "specific_host" => match (raw.host_id, raw.state) {
                (Some(host), Some(state)) => Ok(Condition::SpecificHost { host, state }),
                _ => Err("specific_host condition requires both host_id and state".to_string()),
            },
            _ => Ok(Condition::Unknown { kind: raw.kind }),
        }
    }
}

impl From<Condition> for RawCondition {
    fn from(value: Condition) -> Self {
        let kind = value.kind_name().to_string();
        match value {
            Condition::AnyHostInStates { states } | Condition::AllHostsInStates { states } => {
                RawCondition {
                    kind,
                    states,
                    host_id: None,
                    state: None,
                }
            }
            Condition::SpecificHost { host, state } => RawCondition {
                kind,
                states: Vec::new(),
                host_id: Some(host),
                state: Some(state),
            },
            Condition::Unknown { .. } => RawCondition {
                kind,
                states: Vec::new(),
                host_id: None,
                state: None,
            },
        }
    }
}

/// Agent-state transition triggered by an environmental event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactiveTransition {
    pub trigger: TriggerKind,
    pub from_state: StateGuard,
    pub condition: Condition,
    pub to_state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDecl {
    #[serde(default = "default_agent_state")]
    pub initial_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_action: Option<String>,
    #[serde(default)]
    pub actions: IndexMap<String, ActionRule>,
    #[serde(default)]
    pub transitions: IndexMap<String, DfaTransition>,
    #[serde(default)]
    pub reactive_transitions: IndexMap<String, ReactiveTransition>,
}

fn default_agent_state() -> String {
    DEFAULT_AGENT_STATE.to_string()
}

impl AgentDecl {
    pub fn has_dfa(&self) -> bool {
        !self.transitions.is_empty() || !self.reactive_transitions.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostDecl {
    #[serde(default)]
    pub initial_state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_hosts: Option<usize>,
}

/// Immutable scenario descriptor. Loaded once, shared by every engine built from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(alias = "Topology")]
    pub topology: Topology,
    #[serde(alias = "States")]
    pub states: Vec<String>,
    #[serde(default, alias = "Hosts")]
    pub hosts: IndexMap<String, HostDecl>,
    #[serde(default, alias = "Agents")]
    pub agents: IndexMap<Side, AgentDecl>,
}

impl Scenario {
    pub fn load(path: &ScenarioPath) -> SimResult<Self> {
        Self::load_checked(path).map(|(scenario, _)| scenario)
    }

    /// Loads and validates a scenario, returning it with its validation warnings.
    pub fn load_checked(path: &ScenarioPath) -> SimResult<(Self, Vec<String>)> {
        let p = path.as_path();
        let text = std::fs::read_to_string(p).map_err(|err| {
            SimError::Scenario(format!("failed to read scenario {}: {err}", p.display()))
        })?;
        let is_json = p
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        };
        let scenario = parsed.map_err(|err| {
            SimError::Scenario(format!(
                "failed to parse scenario {}: {err}. expected top-level keys \
                 {{topology:{{hosts}}, states, hosts?, agents?}}",
                p.display()
            ))
        })?;
        let warnings = scenario.validate()?;
        Ok((scenario, warnings))
    }

    pub fn from_yaml_str(text: &str) -> SimResult<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_json_str(text: &str) -> SimResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unnamed")
    }

    pub fn num_hosts(&self) -> usize {
        self.topology.hosts.len()
    }

    pub fn host_names(&self) -> &[String] {
        &self.topology.hosts
    }

    pub fn is_valid_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }

    pub fn agent(&self, side: Side) -> Option<&AgentDecl> {
        self.agents.get(&side)
    }

    pub fn action_rule(&self, side: Side, action: &str) -> Option<&ActionRule> {
        self.agent(side).and_then(|a| a.actions.get(action))
    }

    pub fn idle_action(&self, side: Side) -> &str {
        self.agent(side)
            .and_then(|a| a.idle_action.as_deref())
            .unwrap_or_else(|| side.default_idle_action())
    }

    /// True when at least one agent carries DFA or reactive transitions.
    pub fn has_agent_dfa(&self) -> bool {
        self.agents.values().any(AgentDecl::has_dfa)
    }

    /// Hosts without a declared initial state start in `q0`, or in the first
    /// declared state when `q0` is not one.
    pub fn initial_host_states(&self) -> Vec<String> {
        let fallback = if self.is_valid_state(DEFAULT_HOST_STATE) {
            DEFAULT_HOST_STATE.to_string()
        } else {
            self.states.first().cloned().unwrap_or_default()
        };
        self.topology
            .hosts
            .iter()
            .map(|name| {
                self.hosts
                    .get(name)
                    .and_then(|h| h.initial_state.clone())
                    .unwrap_or_else(|| fallback.clone())
            })
            .collect()
    }

    /// Rejects partial or inconsistent configuration. Returns non-fatal warnings.
    pub fn validate(&self) -> SimResult<Vec<String>> {
        if self.topology.hosts.is_empty() {
            return Err(SimError::Scenario(
                "topology.hosts must not be empty".to_string(),
            ));
        }
        if let Some(n) = self.topology.num_hosts
            && n != self.topology.hosts.len()
        {
            return Err(SimError::Scenario(format!(
                "topology.num_hosts is {n} but {} hosts are listed",
                self.topology.hosts.len()
            )));
        }
        if self.states.is_empty() {
            return Err(SimError::Scenario("states must not be empty".to_string()));
        }

        for (name, decl) in &self.hosts {
            if !self.topology.hosts.iter().any(|h| h == name) {
                return Err(SimError::Scenario(format!(
                    "hosts.{name} is not listed in topology.hosts; known hosts: {}",
                    self.topology.hosts.join(", ")
                )));
            }
            if let Some(state) = &decl.initial_state {
                self.require_state(state, &format!("hosts.{name}.initial_state"))?;
            }
        }

        let mut warnings = Vec::new();
        for (side, agent) in &self.agents {
            for (action, rule) in &agent.actions {
                let at = format!("agents.{side}.actions.{action}");
                if let StateGuard::Exact(label) = &rule.from_state
                    && !self.is_valid_state(label)
                {
                    warnings.push(format!(
                        "{at}.from_state {label:?} is not a declared state; the action is never legal"
                    ));
                }
                for target in rule.to_state.declared_targets() {
                    if !self.is_valid_state(target) {
                        warnings.push(format!(
                            "{at}.to_state {target:?} is not a declared state; resolving to it fails the action"
                        ));
                    }
                }
                if !rule.reward.is_finite() {
                    return Err(SimError::Scenario(format!("{at}.reward must be finite")));
                }
            }
            for (name, t) in &agent.transitions {
                if let Some(host) = &t.target_host
                    && host.resolve(&self.topology.hosts).is_none()
                {
                    return Err(SimError::Scenario(format!(
                        "agents.{side}.transitions.{name}.target_host {host} does not name a host"
                    )));
                }
            }
            for (name, r) in &agent.reactive_transitions {
                let at = format!("agents.{side}.reactive_transitions.{name}");
                if let TriggerKind::Other(kind) = &r.trigger {
                    warnings.push(format!("{at}: unknown trigger {kind:?} never fires"));
                }
                match &r.condition {
                    Condition::SpecificHost { host, .. }
                        if host.resolve(&self.topology.hosts).is_none() =>
                    {
                        return Err(SimError::Scenario(format!(
                            "{at}.condition.host_id {host} does not name a host"
                        )));
                    }
                    Condition::Unknown { kind } => {
                        warnings.push(format!(
                            "{at}: unknown condition type {kind:?} always evaluates false"
                        ));
                    }
                    _ => {}
                }
            }
        }
        for w in &warnings {
            tracing::warn!("{w}");
        }
        Ok(warnings)
    }

    fn require_state(&self, state: &str, at: &str) -> SimResult<()> {
        if self.is_valid_state(state) {
            Ok(())
        } else {
            Err(SimError::Scenario(format!(
                "{at} references undeclared state {state:?}; declared states: {}",
                self.states.join(", ")
            )))
        }
    }

    /// Parsed form of [`EXAMPLE_SCENARIO_YAML`].
    pub fn example() -> SimResult<Self> {
        Self::from_yaml_str(EXAMPLE_SCENARIO_YAML)
    }
}

/// Small four-stage kill chain with a reactive defender, written by `init`.
pub const EXAMPLE_SCENARIO_YAML: &str = r#"
name: example
topology:
  hosts: [web, db, mail]
states: [q0, q1, q2, q3]
agents:
  Red:
    initial_state: p0
    actions:
      DiscoverNetworkServices: {from_state: q0, to_state: q1, reward: 1}
      ExploitRemoteService: {from_state: q1, to_state: q2, reward: 2}
      PrivilegeEscalate: {from_state: q2, to_state: q3, reward: 3}
      Impact: {from_state: q3, to_state: same, reward: 5}
      Sleep: {from_state: any, to_state: same, reward: 0, hostless: true}
    transitions:
      scan: {from_state: p0, action: DiscoverNetworkServices, target_host: 0, on_success: p1, on_failure: p0}
      exploit: {from_state: p1, action: ExploitRemoteService, target_host: 0, on_success: p2, on_failure: p0}
      escalate: {from_state: p2, action: PrivilegeEscalate, target_host: 0, on_success: p3, on_failure: p0}
      impact: {from_state: p3, action: Impact, target_host: 0, on_success: p3, on_failure: p0}
  Blue:
    initial_state: b0
    actions:
      Remove: {from_state: any, to_state: {q0: q0, default: q1}, reward: 1}
      Restore: {from_state: any, to_state: q0, reward: -1}
      NoOp: {from_state: any, to_state: same, reward: 0, hostless: true}
    transitions:
      idle: {from_state: b0, action: NoOp}
      remove: {from_state: b1, action: Remove, target_host: 0, on_success: b0, on_failure: b1}
    reactive_transitions:
      alert:
        trigger: host_state_change
        from_state: b0
        condition: {type: any_host_in_states, states: [q2, q3]}
        to_state: b1
"#;
