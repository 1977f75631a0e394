//! Agent DFA updates from action results and environment events.
//!
//! Rule tables are scanned in declaration order and the first matching rule
//! wins. An event changes an agent's state at most once; there is no cascading
//! within one event.

use std::collections::BTreeMap;

use crate::{
    AgentStateChange, Condition, Scenario, Side, SimResult, StateStore, TriggerEvent, TriggerKind,
};

/// Applies `event` to `side`'s DFA. Returns the change if a rule fired and moved
/// the agent to a different state.
pub fn apply_trigger(
    store: &mut StateStore,
    side: Side,
    event: &TriggerEvent,
) -> SimResult<Option<AgentStateChange>> {
    let scenario = store.scenario().clone();
    let Some(agent) = scenario.agent(side) else {
        return Ok(None);
    };
    let current = store.agent_state(side)?.to_string();

    let fired = match event {
        TriggerEvent::ActionResult { action, success } => agent
            .transitions
            .iter()
            .find(|(_, t)| t.from_state == current && t.action == *action)
            .and_then(|(name, t)| t.target_for(*success).map(|to| (name, to))),
        TriggerEvent::HostStateChange { changes } => agent
            .reactive_transitions
            .iter()
            .find(|(_, r)| {
                r.trigger == TriggerKind::HostStateChange
                    && r.from_state.admits(&current)
                    && evaluate_condition(&r.condition, changes, &scenario)
            })
            .map(|(name, r)| (name, r.to_state.as_str())),
    };

    let Some((rule, to)) = fired else {
        return Ok(None);
    };
    if to == current {
        return Ok(None);
    }
    store.set_agent_state(side, to)?;
    tracing::debug!(
        agent = %side,
        from = %current,
        to = %to,
        rule = %rule,
        trigger = event.kind_name(),
        "agent state transition"
    );
    Ok(Some(AgentStateChange {
        agent: side,
        from: current,
        to: to.to_string(),
        rule: rule.clone(),
        trigger: event.kind_name().to_string(),
    }))
}

/// Evaluates a reactive condition against the changed hosts of one event.
/// Unknown condition kinds evaluate false.
pub fn evaluate_condition(
    condition: &Condition,
    changes: &BTreeMap<usize, String>,
    scenario: &Scenario,
) -> bool {
    match condition {
        Condition::AnyHostInStates { states } => {
            changes.values().any(|s| states.iter().any(|t| t == s))
        }
        Condition::AllHostsInStates { states } => {
            changes.values().all(|s| states.iter().any(|t| t == s))
        }
        Condition::SpecificHost { host, state } => host
            .resolve(scenario.host_names())
            .and_then(|idx| changes.get(&idx))
            .is_some_and(|s| s == state),
        Condition::Unknown { kind } => {
            tracing::warn!("unknown reactive condition type {kind:?}; evaluating as false");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store(doc: &str) -> StateStore {
        StateStore::new(Arc::new(Scenario::from_yaml_str(doc).expect("parse")))
    }

    const DFA: &str = r#"
topology: {hosts: [web, db]}
states: [q0, q1, q2]
agents:
  Red:
    initial_state: p0
    transitions:
      first: {from_state: p0, action: Scan, on_success: p1, on_failure: p9}
      shadowed: {from_state: p0, action: Scan, on_success: p5, on_failure: p5}
      blank: {from_state: p1, action: Scan, on_success: ""}
      next: {from_state: p1, action: Scan, on_success: p2}
  Blue:
    initial_state: b0
    reactive_transitions:
      unknown: {trigger: host_state_change, from_state: any, condition: {type: quorum}, to_state: bx}
      wrong_trigger: {trigger: clock_tick, from_state: any, condition: {type: any_host_in_states, states: [q1]}, to_state: by}
      alert: {trigger: host_state_change, from_state: b0, condition: {type: any_host_in_states, states: [q1, q2]}, to_state: b1}
      db_hit: {trigger: host_state_change, from_state: b0, condition: {type: specific_host, host_id: db, state: q0}, to_state: b2}
      escalate: {trigger: host_state_change, from_state: b1, condition: {type: all_hosts_in_states, states: [q2]}, to_state: b3}
"#;

    fn action(action: &str, success: bool) -> TriggerEvent {
        TriggerEvent::ActionResult {
            action: action.to_string(),
            success,
        }
    }

    #[test]
    fn first_matching_action_rule_wins() {
        let mut s = store(DFA);
        let change = apply_trigger(&mut s, Side::Red, &action("Scan", true))
            .expect("apply")
            .expect("fired");
        assert_eq!(change.rule, "first");
        assert_eq!(s.agent_state(Side::Red).expect("red"), "p1");
    }

    #[test]
    fn failure_outcome_selects_on_failure() {
        let mut s = store(DFA);
        apply_trigger(&mut s, Side::Red, &action("Scan", false)).expect("apply");
        assert_eq!(s.agent_state(Side::Red).expect("red"), "p9");
    }

    #[test]
    fn empty_target_leaves_state_unchanged() {
        let mut s = store(DFA);
        s.set_agent_state(Side::Red, "p1").expect("set");
        let change = apply_trigger(&mut s, Side::Red, &action("Scan", true)).expect("apply");
        assert!(change.is_none());
        assert_eq!(s.agent_state(Side::Red).expect("red"), "p1");
    }

    #[test]
    fn action_rules_ignore_other_actions() {
        let mut s = store(DFA);
        let change = apply_trigger(&mut s, Side::Red, &action("Exploit", true)).expect("apply");
        assert!(change.is_none());
        assert_eq!(s.agent_state(Side::Red).expect("red"), "p0");
    }

    #[test]
    fn reactive_rule_fires_on_matching_change() {
        let mut s = store(DFA);
        let change = apply_trigger(&mut s, Side::Blue, &TriggerEvent::host_changed(0, "q1"))
            .expect("apply")
            .expect("fired");
        assert_eq!(change.rule, "alert");
        assert_eq!(s.agent_state(Side::Blue).expect("blue"), "b1");
    }

    #[test]
    fn one_change_per_event_without_cascading() {
        let mut s = store(DFA);
        // alert fires (b0 -> b1); escalate would also match from b1 but must not cascade.
        apply_trigger(&mut s, Side::Blue, &TriggerEvent::host_changed(1, "q2")).expect("apply");
        assert_eq!(s.agent_state(Side::Blue).expect("blue"), "b1");
        apply_trigger(&mut s, Side::Blue, &TriggerEvent::host_changed(1, "q2")).expect("apply");
        assert_eq!(s.agent_state(Side::Blue).expect("blue"), "b3");
    }

    #[test]
    fn specific_host_resolves_by_name() {
        let mut s = store(DFA);
        apply_trigger(&mut s, Side::Blue, &TriggerEvent::host_changed(0, "q0")).expect("apply");
        assert_eq!(s.agent_state(Side::Blue).expect("blue"), "b0");
        apply_trigger(&mut s, Side::Blue, &TriggerEvent::host_changed(1, "q0")).expect("apply");
        assert_eq!(s.agent_state(Side::Blue).expect("blue"), "b2");
    }

    #[test]
    fn unknown_condition_and_trigger_never_fire() {
        let scenario = Scenario::from_yaml_str(DFA).expect("parse");
        let changes = BTreeMap::from([(0usize, "q1".to_string())]);
        let unknown = Condition::Unknown {
            kind: "quorum".to_string(),
        };
        assert!(!evaluate_condition(&unknown, &changes, &scenario));
    }

    #[test]
    fn action_results_do_not_touch_reactive_rules() {
        let mut s = store(DFA);
        let change = apply_trigger(&mut s, Side::Blue, &action("Remove", true)).expect("apply");
        assert!(change.is_none());
        assert_eq!(s.agent_state(Side::Blue).expect("blue"), "b0");
    }

    #[test]
    fn undeclared_agent_is_ignored() {
        let doc = "topology: {hosts: [a]}\nstates: [q0]\n";
        let mut s = store(doc);
        let change = apply_trigger(&mut s, Side::Red, &action("Scan", true)).expect("apply");
        assert!(change.is_none());
    }
}
