//! Executes one agent action against the state store.

use serde::{Deserialize, Serialize};

use crate::{
    AgentStateChange, Legality, Side, SimResult, StateStore, TriggerEvent, apply_trigger,
    check_legality,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub new_state: String,
    pub reward: f64,
    pub message: String,
    /// Agent DFA changes caused by this action, in the order they were applied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_changes: Vec<AgentStateChange>,
}

/// Runs `side`'s `action` on `host`.
///
/// An out-of-range host is an error. An illegal action is not: it yields a
/// failed result with zero reward, leaves every host untouched, and only
/// notifies the actor's DFA of the failure.
pub fn execute_action(
    store: &mut StateStore,
    side: Side,
    action: &str,
    host: usize,
) -> SimResult<ActionResult> {
    let current = store.host_state(host)?.to_string();
    let scenario = store.scenario().clone();

    let (target, reward) = match check_legality(&scenario, side, action, &current) {
        Legality::Legal { target, reward } => (target.to_string(), reward),
        verdict => {
            let message = verdict.describe(side, action, &current);
            tracing::debug!(agent = %side, action, host, "action rejected: {message}");
            let mut agent_changes = Vec::new();
            let failed = TriggerEvent::ActionResult {
                action: action.to_string(),
                success: false,
            };
            agent_changes.extend(apply_trigger(store, side, &failed)?);
            return Ok(ActionResult {
                success: false,
                new_state: current,
                reward: 0.0,
                message,
                agent_changes,
            });
        }
    };

    store.set_host_state(host, &target)?;
    let mut agent_changes = Vec::new();

    if target != current {
        let changed = TriggerEvent::host_changed(host, target.clone());
        let agents: Vec<Side> = scenario.agents.keys().copied().collect();
        for agent in agents {
            agent_changes.extend(apply_trigger(store, agent, &changed)?);
        }
    }

    let succeeded = TriggerEvent::ActionResult {
        action: action.to_string(),
        success: true,
    };
    agent_changes.extend(apply_trigger(store, side, &succeeded)?);

    tracing::debug!(
        agent = %side,
        action,
        host,
        from = %current,
        to = %target,
        reward,
        "action executed"
    );
    Ok(ActionResult {
        success: true,
        new_state: target,
        reward,
        message: format!("action {action:?} executed successfully"),
        agent_changes,
    })
}
