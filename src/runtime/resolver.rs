//! Transition resolution and legality checks. Pure functions over the scenario.

use crate::{ActionRule, Scenario, Side, StateGuard};

/// Candidate target state and reward for applying `rule` to a host in `source`.
pub fn resolve<'a>(source: &'a str, rule: &'a ActionRule) -> (&'a str, f64) {
    (rule.to_state.resolve(source), rule.reward)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Legality<'a> {
    Legal { target: &'a str, reward: f64 },
    UndeclaredAction,
    SourceMismatch { required: &'a str },
    InvalidSource,
    InvalidTarget { target: &'a str },
}

impl Legality<'_> {
    pub fn is_legal(&self) -> bool {
        matches!(self, Legality::Legal { .. })
    }

    pub fn describe(&self, side: Side, action: &str, source: &str) -> String {
        match self {
            Legality::Legal { target, .. } => format!("{action}: {source} -> {target}"),
            Legality::UndeclaredAction => {
                format!("action {action:?} is not declared for agent {side}")
            }
            Legality::SourceMismatch { required } => format!(
                "action {action:?} requires host state {required:?}, host is in {source:?}"
            ),
            Legality::InvalidSource => format!("host state {source:?} is not a declared state"),
            Legality::InvalidTarget { target } => {
                format!("invalid transition: {source} -> {target} (undeclared state)")
            }
        }
    }
}

/// Full legality verdict for `side` applying `action` to a host in `source`.
pub fn check_legality<'a>(
    scenario: &'a Scenario,
    side: Side,
    action: &str,
    source: &'a str,
) -> Legality<'a> {
    let Some(rule) = scenario.action_rule(side, action) else {
        return Legality::UndeclaredAction;
    };
    if let StateGuard::Exact(required) = &rule.from_state
        && required != source
    {
        return Legality::SourceMismatch { required };
    }
    if !scenario.is_valid_state(source) {
        return Legality::InvalidSource;
    }
    let (target, reward) = resolve(source, rule);
    if !scenario.is_valid_state(target) {
        return Legality::InvalidTarget { target };
    }
    Legality::Legal { target, reward }
}

pub fn is_legal(scenario: &Scenario, side: Side, action: &str, source: &str) -> bool {
    check_legality(scenario, side, action, source).is_legal()
}
