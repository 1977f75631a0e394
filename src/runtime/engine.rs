//! Episode engine: turn sequencing, reward bookkeeping and the episode trace.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use std::sync::Arc;

use crate::{
    ActionResult, AgentChangeLog, AgentStateChange, HOSTLESS_PLACEHOLDER, Policy, PolicyChoice,
    PolicyView, RewardLedger, RewardSummary, Scenario, Side, SimError, SimResult, StateStore,
    execute_action,
};

pub const DEFAULT_MAX_STEPS: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineOptions {
    pub max_steps: u64,
    /// `None` appends agent states to observations whenever any agent declares a DFA.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observe_agent_states: Option<bool>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            observe_agent_states: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpisodePhase {
    NotStarted,
    Running,
    Done,
}

/// One executed (or recorded idle) action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub step: u64,
    pub agent: Side,
    pub action: String,
    pub host: usize,
    pub reward: f64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSummary {
    pub action: String,
    pub host: usize,
    pub reward: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub state_vector: Vec<String>,
    pub reward: f64,
    pub opponent_reward: f64,
    pub total_step_reward: f64,
    pub done: bool,
    pub total_reward: f64,
    pub current_agent: Side,
    pub last_actions: IndexMap<Side, ActionSummary>,
    pub actor_result: ActionResult,
    /// `None` when the opponent's idle action was recorded without executing it.
    pub opponent_result: Option<ActionResult>,
}

impl StepOutcome {
    pub fn success(&self) -> bool {
        self.actor_result.success
    }
}

/// Owns every piece of mutable episode state. One engine per episode; run
/// concurrent episodes on separate engines.
#[derive(Debug, Clone)]
pub struct EpisodeEngine {
    scenario: Arc<Scenario>,
    options: EngineOptions,
    store: StateStore,
    ledger: RewardLedger,
    trace: Vec<TraceRecord>,
    last_actions: IndexMap<Side, ActionSummary>,
    agent_changes: AgentChangeLog,
    phase: EpisodePhase,
    current: Side,
    steps: u64,
}

impl EpisodeEngine {
    /// Builds an engine, refusing scenarios that fail validation.
    pub fn new(scenario: Arc<Scenario>, options: EngineOptions) -> SimResult<Self> {
        scenario.validate()?;
        if options.max_steps == 0 {
            return Err(SimError::InvalidArgument(
                "max_steps must be at least 1".to_string(),
            ));
        }
        let store = StateStore::new(scenario.clone());
        Ok(Self {
            scenario,
            options,
            store,
            ledger: RewardLedger::default(),
            trace: Vec::new(),
            last_actions: IndexMap::new(),
            agent_changes: AgentChangeLog::default(),
            phase: EpisodePhase::NotStarted,
            current: Side::Red,
            steps: 0,
        })
    }

    pub fn scenario(&self) -> &Arc<Scenario> {
        &self.scenario
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn observes_agent_states(&self) -> bool {
        self.options
            .observe_agent_states
            .unwrap_or_else(|| self.scenario.has_agent_dfa())
    }

    /// Restarts the episode and returns the initial observation.
    pub fn reset(&mut self) -> Vec<String> {
        self.store.reset();
        self.ledger.reset();
        self.trace.clear();
        self.last_actions.clear();
        self.agent_changes.clear();
        self.current = Side::Red;
        self.steps = 0;
        self.phase = EpisodePhase::Running;
        self.observation()
    }

    /// Runs the current agent's action, then the opponent's, and hands the
    /// first move of the next step to the other agent.
    ///
    /// Without an opponent action the opponent's idle action is recorded on
    /// the placeholder host with zero reward and not executed.
    pub fn step(
        &mut self,
        action: &str,
        host: usize,
        opponent: Option<(&str, usize)>,
    ) -> SimResult<StepOutcome> {
        self.ensure_running()?;
        self.store.check_host(host)?;
        if let Some((_, opponent_host)) = opponent {
            self.store.check_host(opponent_host)?;
        }
        let actor_result = self.run_actor(action, host)?;
        self.finish_step(action, host, actor_result, opponent)
    }

    /// Steps with moves chosen by policies. The actor's policy always sees the
    /// pre-step world. The opponent's policy sees the same world, unless it
    /// reacts within the step, in which case it is asked after the actor's
    /// action has been applied.
    pub fn auto_step(
        &mut self,
        red: &mut dyn Policy,
        blue: &mut dyn Policy,
    ) -> SimResult<StepOutcome> {
        self.ensure_running()?;
        let actor = self.current;
        let other = actor.opponent();
        let reacts = match other {
            Side::Red => red.reacts_within_step(),
            Side::Blue => blue.reacts_within_step(),
        };

        let mine = self.choose(actor, red, blue);
        let early = if reacts {
            None
        } else {
            Some(self.choose(other, red, blue))
        };
        self.store.check_host(mine.host)?;
        if let Some(choice) = &early {
            self.store.check_host(choice.host)?;
        }

        let actor_result = self.run_actor(&mine.action, mine.host)?;
        let theirs = match early {
            Some(choice) => choice,
            None => {
                let choice = self.choose(other, red, blue);
                self.store.check_host(choice.host)?;
                choice
            }
        };
        self.finish_step(
            &mine.action,
            mine.host,
            actor_result,
            Some((theirs.action.as_str(), theirs.host)),
        )
    }

    fn ensure_running(&self) -> SimResult<()> {
        match self.phase {
            EpisodePhase::Running => Ok(()),
            EpisodePhase::NotStarted => Err(SimError::InvalidArgument(
                "episode not started; call reset first".to_string(),
            )),
            EpisodePhase::Done => Err(SimError::InvalidArgument(format!(
                "episode is done after {} steps; call reset to start again",
                self.steps
            ))),
        }
    }

    fn choose(&self, side: Side, red: &mut dyn Policy, blue: &mut dyn Policy) -> PolicyChoice {
        let view = PolicyView {
            scenario: self.scenario.as_ref(),
            store: &self.store,
            side,
            step: self.steps,
        };
        match side {
            Side::Red => red.choose(&view),
            Side::Blue => blue.choose(&view),
        }
    }

    fn run_actor(&mut self, action: &str, host: usize) -> SimResult<ActionResult> {
        let actor = self.current;
        let result = execute_action(&mut self.store, actor, action, host)?;
        self.record(actor, action, host, result.reward, result.success);
        self.agent_changes.extend(result.agent_changes.iter().cloned());
        Ok(result)
    }

    fn finish_step(
        &mut self,
        action: &str,
        host: usize,
        actor_result: ActionResult,
        opponent: Option<(&str, usize)>,
    ) -> SimResult<StepOutcome> {
        let actor = self.current;
        let other = actor.opponent();

        let (opponent_action, opponent_host, opponent_result) = match opponent {
            Some((opponent_action, opponent_host)) => {
                let res = execute_action(&mut self.store, other, opponent_action, opponent_host)?;
                self.agent_changes.extend(res.agent_changes.iter().cloned());
                (opponent_action.to_string(), opponent_host, Some(res))
            }
            None => (
                self.scenario.idle_action(other).to_string(),
                HOSTLESS_PLACEHOLDER,
                None,
            ),
        };
        let opponent_reward = opponent_result.as_ref().map_or(0.0, |r| r.reward);
        let opponent_success = opponent_result.as_ref().is_none_or(|r| r.success);
        self.record(
            other,
            &opponent_action,
            opponent_host,
            opponent_reward,
            opponent_success,
        );

        self.steps += 1;
        let done = self.steps >= self.options.max_steps;
        if done {
            self.phase = EpisodePhase::Done;
        }
        self.current = other;

        tracing::debug!(
            step = self.steps,
            actor = %actor,
            action,
            host,
            reward = actor_result.reward,
            opponent_action = %opponent_action,
            opponent_reward,
            done,
            "step complete"
        );

        let mut last_actions = IndexMap::new();
        for side in [actor, other] {
            if let Some(summary) = self.last_actions.get(&side) {
                last_actions.insert(side, summary.clone());
            }
        }

        Ok(StepOutcome {
            state_vector: self.observation(),
            reward: actor_result.reward,
            opponent_reward,
            total_step_reward: actor_result.reward + opponent_reward,
            done,
            total_reward: self.ledger.total(),
            current_agent: self.current,
            last_actions,
            actor_result,
            opponent_result,
        })
    }

    fn record(&mut self, side: Side, action: &str, host: usize, reward: f64, success: bool) {
        self.ledger.record(side, reward);
        self.trace.push(TraceRecord {
            step: self.steps,
            agent: side,
            action: action.to_string(),
            host,
            reward,
            success,
        });
        self.last_actions.insert(
            side,
            ActionSummary {
                action: action.to_string(),
                host,
                reward,
            },
        );
    }

    pub fn observation(&self) -> Vec<String> {
        self.store.state_vector(self.observes_agent_states())
    }

    pub fn current_agent(&self) -> Side {
        self.current
    }

    pub fn step_count(&self) -> u64 {
        self.steps
    }

    pub fn is_done(&self) -> bool {
        self.phase == EpisodePhase::Done
    }

    pub fn get_total_reward(&self) -> f64 {
        self.ledger.total()
    }

    pub fn reward_summary(&self) -> RewardSummary {
        self.ledger.summary()
    }

    pub fn get_trace(&self) -> &[TraceRecord] {
        &self.trace
    }

    pub fn get_last_action(&self, side: Side) -> Option<&ActionSummary> {
        self.last_actions.get(&side)
    }

    pub fn get_last_actions(&self) -> &IndexMap<Side, ActionSummary> {
        &self.last_actions
    }

    pub fn agent_states(&self) -> &IndexMap<Side, String> {
        self.store.agent_states()
    }

    pub fn agent_changes(&self) -> &[AgentStateChange] {
        &self.agent_changes.changes
    }
}
