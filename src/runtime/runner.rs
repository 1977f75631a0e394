//! Drives whole episodes: run with policies, record, replay, batch, validate.

use rand_core::RngCore as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::{
    BatchEntry, BatchSummary, Config, DEFAULT_CONFIG_FILE, DEFAULT_SCENARIO_GLOBS,
    EXAMPLE_SCENARIO_YAML, EngineOptions, EpisodeEngine, EpisodeSummary, ExitStatus, PolicyKind,
    RecordCollisionPolicy, RunIdentity, RunMode, Scenario, ScenarioPath, Side, SimError,
    SimResult, StepInput, StepTrace, TraceFile, TracePath, find_matching_files,
    wall_time_iso_utc, write_report, write_trace_with_policy,
};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub red: PolicyKind,
    pub blue: PolicyKind,
    pub seed: Option<u64>,
    pub max_steps: Option<u64>,
    pub record_trace_to: Option<PathBuf>,
    pub record_collision: RecordCollisionPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            red: PolicyKind::Dfa,
            blue: PolicyKind::Dfa,
            seed: None,
            max_steps: None,
            record_trace_to: None,
            record_collision: RecordCollisionPolicy::Error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub run: RunOptions,
    pub jobs: usize,
    /// Directory the scenario globs are matched against.
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub path: String,
    pub name: String,
    pub hosts: Vec<String>,
    pub states: Vec<String>,
    pub agents: Vec<Side>,
    #[serde(rename = "agentDfa")]
    pub agent_dfa: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Engine state after an episode, plus what the trace needs to replay it.
struct EpisodeRun {
    engine: EpisodeEngine,
    initial_observation: Vec<String>,
    steps: Vec<StepTrace>,
}

fn drive_episode(
    scenario: Arc<Scenario>,
    red: PolicyKind,
    blue: PolicyKind,
    seed: u64,
    options: EngineOptions,
) -> SimResult<EpisodeRun> {
    let mut engine = EpisodeEngine::new(scenario, options)?;
    let mut red_policy = red.build(derive_seed(seed, Side::Red));
    let mut blue_policy = blue.build(derive_seed(seed, Side::Blue));

    let initial_observation = engine.reset();
    let mut steps = Vec::new();
    while !engine.is_done() {
        let index = engine.step_count();
        let first = engine.current_agent();
        let out = engine.auto_step(red_policy.as_mut(), blue_policy.as_mut())?;

        let input = |side: Side| {
            out.last_actions.get(&side).map(|a| StepInput {
                action: a.action.clone(),
                host: a.host,
            })
        };
        let actor = input(first).ok_or_else(|| {
            SimError::InvalidArgument(format!("step {index} recorded no action for {first}"))
        })?;
        let opponent = input(first.opponent());
        let trace = engine.get_trace();
        let records = trace[trace.len().saturating_sub(2)..].to_vec();

        tracing::info!(
            step = index + 1,
            first = %first,
            action = %actor.action,
            host = actor.host,
            reward = out.reward,
            opponent_reward = out.opponent_reward,
            total = out.total_reward,
            state = %out.state_vector.join(","),
            "step"
        );
        steps.push(StepTrace {
            index,
            first,
            actor,
            opponent,
            records,
            observation: out.state_vector,
            done: out.done,
        });
    }
    Ok(EpisodeRun {
        engine,
        initial_observation,
        steps,
    })
}

/// Runs one episode of `scenario_path` and writes its report and trace under
/// `<base_dir>/runs/<run_id>/`.
pub fn run_episode(
    config: &Config,
    scenario_path: ScenarioPath,
    opt: &RunOptions,
) -> SimResult<EpisodeSummary> {
    execute_episode(config, scenario_path, opt, RunMode::Run)
}

fn execute_episode(
    config: &Config,
    scenario_path: ScenarioPath,
    opt: &RunOptions,
    mode: RunMode,
) -> SimResult<EpisodeSummary> {
    let seed = opt.seed.unwrap_or_else(gen_seed);
    let run_id = Uuid::new_v4().to_string();
    let scenario = Arc::new(Scenario::load(&scenario_path)?);
    let options = config.engine_options(opt.max_steps);

    let started_at = wall_time_iso_utc();
    let started = Instant::now();
    let run = drive_episode(scenario.clone(), opt.red, opt.blue, seed, options)?;
    let finished_at = wall_time_iso_utc();
    let duration_ms = started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;

    let artifacts_dir = config.runs_dir().join(&run_id);
    let path_text = scenario_path.as_path().to_string_lossy().to_string();
    let mut summary = EpisodeSummary {
        status: ExitStatus::Pass,
        mode,
        identity: RunIdentity {
            run_id,
            seed,
            trace_path: None,
            report_path: Some(artifacts_dir.join("report.json").to_string_lossy().to_string()),
            artifacts_dir: Some(artifacts_dir.to_string_lossy().to_string()),
        },
        started_at,
        finished_at,
        duration_ms,
        findings: Vec::new(),
        ..summarize(&run.engine, Some(path_text.clone()), opt.red.as_str(), opt.blue.as_str())
    };

    let trace = TraceFile::new(
        Some(path_text),
        scenario.as_ref().clone(),
        opt.red.as_str().to_string(),
        opt.blue.as_str().to_string(),
        seed,
        run.engine.options(),
        run.initial_observation,
        run.steps,
        run.engine.agent_changes().to_vec(),
        summary.clone(),
    );
    let trace_path = artifacts_dir.join("trace.json");
    trace.write_json(&trace_path)?;
    summary.identity.trace_path = Some(trace_path.to_string_lossy().to_string());
    if let Some(requested) = &opt.record_trace_to {
        let written = write_trace_with_policy(&trace, requested, opt.record_collision)?;
        summary.identity.trace_path = Some(written.to_string_lossy().to_string());
    }
    write_report(&summary, &artifacts_dir)?;
    Ok(summary)
}

fn summarize(
    engine: &EpisodeEngine,
    scenario_path: Option<String>,
    red: &str,
    blue: &str,
) -> EpisodeSummary {
    let rewards = engine.reward_summary();
    EpisodeSummary {
        status: ExitStatus::Pass,
        mode: RunMode::Run,
        identity: RunIdentity {
            run_id: String::new(),
            seed: 0,
            trace_path: None,
            report_path: None,
            artifacts_dir: None,
        },
        scenario: engine.scenario().display_name().to_string(),
        scenario_path,
        red_policy: red.to_string(),
        blue_policy: blue.to_string(),
        steps: engine.step_count(),
        host_states: engine.store().host_states().to_vec(),
        agent_states: engine.agent_states().clone(),
        rewards: rewards.total_rewards,
        total_reward: rewards.total,
        started_at: String::new(),
        finished_at: String::new(),
        duration_ms: 0,
        findings: Vec::new(),
    }
}

/// Re-executes every recorded step on a fresh engine and checks records and
/// observations. The summary status is `Fail` on the first divergence.
pub fn replay_trace(config: &Config, trace_path: TracePath) -> SimResult<EpisodeSummary> {
    let trace = TraceFile::read_json(trace_path.as_path())?;
    let run_id = Uuid::new_v4().to_string();

    let started_at = wall_time_iso_utc();
    let started = Instant::now();
    let mut engine = EpisodeEngine::new(Arc::new(trace.scenario.clone()), trace.options)?;
    let findings = check_replay(&mut engine, &trace)?;
    let finished_at = wall_time_iso_utc();
    let duration_ms = started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64;

    let artifacts_dir = config.runs_dir().join(&run_id);
    let status = if findings.is_empty() {
        ExitStatus::Pass
    } else {
        ExitStatus::Fail
    };
    let summary = EpisodeSummary {
        status,
        mode: RunMode::Replay,
        identity: RunIdentity {
            run_id,
            seed: trace.seed,
            trace_path: Some(trace_path.as_path().to_string_lossy().to_string()),
            report_path: Some(artifacts_dir.join("report.json").to_string_lossy().to_string()),
            artifacts_dir: Some(artifacts_dir.to_string_lossy().to_string()),
        },
        started_at,
        finished_at,
        duration_ms,
        findings,
        ..summarize(
            &engine,
            trace.scenario_path.clone(),
            &trace.red_policy,
            &trace.blue_policy,
        )
    };
    write_report(&summary, &artifacts_dir)?;
    Ok(summary)
}

fn check_replay(engine: &mut EpisodeEngine, trace: &TraceFile) -> SimResult<Vec<String>> {
    let initial = engine.reset();
    if initial != trace.initial_observation {
        return Ok(vec![format!(
            "initial observation differs: recorded [{}], replayed [{}]",
            trace.initial_observation.join(","),
            initial.join(",")
        )]);
    }
    for step in &trace.steps {
        if engine.current_agent() != step.first {
            return Ok(vec![format!(
                "step {}: recorded first mover {}, replay has {}",
                step.index,
                step.first,
                engine.current_agent()
            )]);
        }
        let opponent = step.opponent.as_ref().map(|o| (o.action.as_str(), o.host));
        let out = engine.step(&step.actor.action, step.actor.host, opponent)?;
        let replayed = engine.get_trace();
        let records = &replayed[replayed.len().saturating_sub(step.records.len())..];
        if records != step.records.as_slice() {
            return Ok(vec![format!(
                "step {}: trace records differ: recorded {:?}, replayed {:?}",
                step.index, step.records, records
            )]);
        }
        if out.state_vector != step.observation {
            return Ok(vec![format!(
                "step {}: observation differs: recorded [{}], replayed [{}]",
                step.index,
                step.observation.join(","),
                out.state_vector.join(",")
            )]);
        }
        if out.done != step.done {
            return Ok(vec![format!(
                "step {}: recorded done={}, replayed done={}",
                step.index, step.done, out.done
            )]);
        }
    }
    let total = engine.get_total_reward();
    if total != trace.summary.total_reward {
        return Ok(vec![format!(
            "total reward differs: recorded {}, replayed {total}",
            trace.summary.total_reward
        )]);
    }
    Ok(Vec::new())
}

/// Runs every matching scenario on its own engine, spread over `jobs` threads.
pub fn run_batch(
    config: &Config,
    globs: &[String],
    opt: &BatchOptions,
) -> SimResult<BatchSummary> {
    let patterns: Vec<String> = if globs.is_empty() {
        DEFAULT_SCENARIO_GLOBS.iter().map(|s| s.to_string()).collect()
    } else {
        globs.to_vec()
    };
    let paths = find_matching_files(&opt.root, &patterns)?;
    if paths.is_empty() {
        return Err(SimError::InvalidArgument(format!(
            "no scenario files matched (patterns={patterns:?})"
        )));
    }
    if opt.run.record_trace_to.is_some() {
        return Err(SimError::InvalidArgument(
            "--record is not supported for batch runs; traces are kept per run".to_string(),
        ));
    }

    let run_id = Uuid::new_v4().to_string();
    let started = Instant::now();
    let jobs = opt.jobs.clamp(1, paths.len());
    let chunk = paths.len().div_ceil(jobs);

    let mut entries: Vec<BatchEntry> = std::thread::scope(|scope| {
        let handles: Vec<_> = paths
            .chunks(chunk)
            .map(|shard| {
                scope.spawn(move || {
                    shard
                        .iter()
                        .map(|path| batch_entry(config, path, &opt.run))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| match h.join() {
                Ok(entries) => entries,
                Err(_) => vec![BatchEntry {
                    scenario_path: "<worker>".to_string(),
                    status: ExitStatus::Error,
                    summary: None,
                    error: Some("batch worker panicked".to_string()),
                }],
            })
            .collect()
    });
    entries.sort_by(|a, b| a.scenario_path.cmp(&b.scenario_path));

    let passed = entries
        .iter()
        .filter(|e| e.status == ExitStatus::Pass)
        .count() as u64;
    let errored = entries.len() as u64 - passed;
    let artifacts_dir = config.runs_dir().join(&run_id);
    let mut summary = BatchSummary {
        status: if errored == 0 {
            ExitStatus::Pass
        } else {
            ExitStatus::Error
        },
        run_id,
        passed,
        errored,
        entries,
        report_path: None,
        duration_ms: started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64,
    };
    summary.report_path = Some(artifacts_dir.join("report.json").to_string_lossy().to_string());
    write_report(&summary, &artifacts_dir)?;
    Ok(summary)
}

fn batch_entry(config: &Config, path: &Path, run: &RunOptions) -> BatchEntry {
    let scenario_path = path.to_string_lossy().to_string();
    match execute_episode(config, ScenarioPath::new(path.to_path_buf()), run, RunMode::Batch) {
        Ok(summary) => BatchEntry {
            scenario_path,
            status: summary.status,
            summary: Some(summary),
            error: None,
        },
        Err(err) => {
            tracing::warn!("batch: {scenario_path}: {err}");
            BatchEntry {
                scenario_path,
                status: ExitStatus::Error,
                summary: None,
                error: Some(err.to_string()),
            }
        }
    }
}

pub fn validate_scenario(scenario_path: &ScenarioPath) -> SimResult<ValidationReport> {
    let (scenario, warnings) = Scenario::load_checked(scenario_path)?;
    Ok(ValidationReport {
        ok: true,
        path: scenario_path.as_path().to_string_lossy().to_string(),
        name: scenario.display_name().to_string(),
        hosts: scenario.host_names().to_vec(),
        states: scenario.states.clone(),
        agents: scenario.agents.keys().copied().collect(),
        agent_dfa: scenario.has_agent_dfa(),
        warnings,
    })
}

/// Scaffolds `dfasim.toml`, the artifact directory and an example scenario under `root`.
pub fn init_project(config: &Config, root: &Path, force: bool) -> SimResult<Vec<PathBuf>> {
    let base = root.join(&config.base_dir);
    if base.exists() && !force {
        return Err(SimError::InvalidArgument(format!(
            "{} already exists (use --force to overwrite)",
            base.display()
        )));
    }
    std::fs::create_dir_all(base.join("runs"))?;
    let mut written = Vec::new();

    let config_path = root.join(DEFAULT_CONFIG_FILE);
    if force || !config_path.exists() {
        let cfg = toml::to_string_pretty(config).map_err(|e| SimError::Config(e.to_string()))?;
        std::fs::write(&config_path, cfg)?;
        written.push(config_path);
    }

    let scenarios = root.join("scenarios");
    std::fs::create_dir_all(&scenarios)?;
    let example = scenarios.join("example.yaml");
    if force || !example.exists() {
        std::fs::write(&example, EXAMPLE_SCENARIO_YAML.trim_start())?;
        written.push(example);
    }
    Ok(written)
}

/// Per-agent policy seed, so two random policies never share a stream.
fn derive_seed(seed: u64, side: Side) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed.to_le_bytes());
    hasher.update(side.name().as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
    u64::from_le_bytes(out)
}

fn gen_seed() -> u64 {
    let mut seed = [0u8; 8];
    rand_core::OsRng.fill_bytes(&mut seed);
    u64::from_le_bytes(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (PathBuf, Config) {
        let root = std::env::temp_dir().join(format!("dfasim-runner-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).expect("dir");
        let config = Config {
            base_dir: root.join(".dfasim"),
            ..Config::default()
        };
        (root, config)
    }

    fn example_path(root: &Path) -> ScenarioPath {
        let path = root.join("example.yaml");
        std::fs::write(&path, EXAMPLE_SCENARIO_YAML).expect("write");
        ScenarioPath::new(path)
    }

    #[test]
    fn run_writes_report_and_replayable_trace() {
        let (root, config) = workspace();
        let opt = RunOptions {
            red: PolicyKind::Random,
            blue: PolicyKind::Reactive,
            seed: Some(11),
            max_steps: Some(6),
            ..RunOptions::default()
        };
        let summary = run_episode(&config, example_path(&root), &opt).expect("run");
        assert_eq!(summary.status, ExitStatus::Pass);
        assert_eq!(summary.steps, 6);
        let report = summary.identity.report_path.clone().expect("report");
        assert!(Path::new(&report).exists());

        let trace_path = summary.identity.trace_path.clone().expect("trace");
        let trace = TraceFile::read_json(Path::new(&trace_path)).expect("read");
        assert_eq!(trace.steps.len(), 6);
        assert_eq!(trace.records().count(), 12);
        let sum: f64 = trace.records().map(|r| r.reward).sum();
        assert!((sum - summary.total_reward).abs() < 1e-9);

        let replayed = replay_trace(&config, TracePath::new(PathBuf::from(trace_path))).expect("replay");
        assert_eq!(replayed.status, ExitStatus::Pass, "{:?}", replayed.findings);
        assert_eq!(replayed.host_states, summary.host_states);
    }

    #[test]
    fn same_seed_reproduces_the_episode() {
        let (root, config) = workspace();
        let opt = RunOptions {
            red: PolicyKind::Random,
            blue: PolicyKind::Random,
            seed: Some(5),
            max_steps: Some(8),
            ..RunOptions::default()
        };
        let path = example_path(&root);
        let a = run_episode(&config, path.clone(), &opt).expect("run a");
        let b = run_episode(&config, path, &opt).expect("run b");
        assert_eq!(a.host_states, b.host_states);
        assert_eq!(a.rewards, b.rewards);
    }

    #[test]
    fn tampered_step_input_is_reported_as_mismatch() {
        let (root, config) = workspace();
        let opt = RunOptions {
            red: PolicyKind::Killchain,
            blue: PolicyKind::Sleep,
            seed: Some(1),
            max_steps: Some(3),
            ..RunOptions::default()
        };
        let summary = run_episode(&config, example_path(&root), &opt).expect("run");
        let trace_path = PathBuf::from(summary.identity.trace_path.expect("trace"));
        let mut trace = TraceFile::read_json(&trace_path).expect("read");
        trace.steps[0].actor.host = 2;
        let tampered = root.join("tampered.json");
        trace.write_json(&tampered).expect("write");

        let replayed = replay_trace(&config, TracePath::new(tampered)).expect("replay");
        assert_eq!(replayed.status, ExitStatus::Fail);
        assert!(replayed.findings[0].contains("step 0"));
    }

    #[test]
    fn batch_runs_each_scenario_and_reports_errors() {
        let (root, config) = workspace();
        let dir = root.join("scenarios");
        std::fs::create_dir_all(&dir).expect("dir");
        for name in ["a.yaml", "b.yaml", "c.yaml"] {
            std::fs::write(dir.join(name), EXAMPLE_SCENARIO_YAML).expect("write");
        }
        std::fs::write(dir.join("broken.yaml"), "states: [q0]\n").expect("write");
        let opt = BatchOptions {
            run: RunOptions {
                max_steps: Some(2),
                seed: Some(3),
                ..RunOptions::default()
            },
            jobs: 2,
            root: root.clone(),
        };
        let summary = run_batch(&config, &[], &opt).expect("batch");
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.errored, 1);
        assert_eq!(summary.status, ExitStatus::Error);
        let broken = summary
            .entries
            .iter()
            .find(|e| e.scenario_path.ends_with("broken.yaml"))
            .expect("entry");
        assert!(broken.error.as_deref().is_some_and(|e| e.contains("failed to parse scenario")));
    }

    #[test]
    fn init_scaffolds_a_valid_example() {
        let (root, config) = workspace();
        let written = init_project(&config, &root, false).expect("init");
        assert_eq!(written.len(), 2);
        let report = validate_scenario(&ScenarioPath::new(root.join("scenarios/example.yaml")))
            .expect("validate");
        assert!(report.ok);
        assert_eq!(report.hosts, vec!["web", "db", "mail"]);
        assert!(init_project(&config, &root, false).is_err());
        assert!(init_project(&config, &root, true).is_ok());
    }

    #[test]
    fn derived_seeds_differ_per_side() {
        assert_ne!(derive_seed(1, Side::Red), derive_seed(1, Side::Blue));
        assert_eq!(derive_seed(1, Side::Red), derive_seed(1, Side::Red));
    }
}
