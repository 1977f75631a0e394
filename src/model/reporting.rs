//! Reporting types and renderers.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::{Side, SimResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reporter {
    Pretty,
    Json,
}

impl clap::ValueEnum for Reporter {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Pretty, Self::Json]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            Self::Pretty => clap::builder::PossibleValue::new("pretty"),
            Self::Json => clap::builder::PossibleValue::new("json"),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Pass,
    Fail,
    Error,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Pass => 0,
            Self::Fail => 1,
            Self::Error => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Run,
    Batch,
    Replay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIdentity {
    #[serde(rename = "runId")]
    pub run_id: String,
    pub seed: u64,
    #[serde(rename = "tracePath", skip_serializing_if = "Option::is_none")]
    pub trace_path: Option<String>,
    #[serde(rename = "reportPath", skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    #[serde(rename = "artifactsDir", skip_serializing_if = "Option::is_none")]
    pub artifacts_dir: Option<String>,
}

/// Outcome of one episode run or replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub status: ExitStatus,
    pub mode: RunMode,
    pub identity: RunIdentity,
    pub scenario: String,
    #[serde(rename = "scenarioPath", skip_serializing_if = "Option::is_none")]
    pub scenario_path: Option<String>,
    #[serde(rename = "redPolicy")]
    pub red_policy: String,
    #[serde(rename = "bluePolicy")]
    pub blue_policy: String,
    pub steps: u64,
    #[serde(rename = "hostStates")]
    pub host_states: Vec<String>,
    #[serde(rename = "agentStates", default, skip_serializing_if = "IndexMap::is_empty")]
    pub agent_states: IndexMap<Side, String>,
    pub rewards: IndexMap<Side, f64>,
    #[serde(rename = "totalReward")]
    pub total_reward: f64,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "finishedAt")]
    pub finished_at: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    /// Replay mismatches or run errors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<String>,
}

impl EpisodeSummary {
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "status={:?} mode={:?} runId={} seed={}\n",
            self.status, self.mode, self.identity.run_id, self.identity.seed
        ));
        out.push_str(&format!(
            "scenario={} red={} blue={} steps={}\n",
            self.scenario, self.red_policy, self.blue_policy, self.steps
        ));
        out.push_str(&format!("hosts=[{}]\n", self.host_states.join(", ")));
        if !self.agent_states.is_empty() {
            let agents: Vec<String> = self
                .agent_states
                .iter()
                .map(|(side, state)| format!("{side}={state}"))
                .collect();
            out.push_str(&format!("agents: {}\n", agents.join(" ")));
        }
        let rewards: Vec<String> = self
            .rewards
            .iter()
            .map(|(side, r)| format!("{side}={r:.2}"))
            .collect();
        out.push_str(&format!(
            "rewards: {} total={:.2}\n",
            rewards.join(" "),
            self.total_reward
        ));
        if let Some(path) = &self.identity.trace_path {
            out.push_str(&format!("trace={path}\n"));
        }
        if let Some(path) = &self.identity.report_path {
            out.push_str(&format!("report={path}\n"));
        }
        for finding in &self.findings {
            out.push_str(&format!("- {finding}\n"));
        }
        out.trim_end().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    #[serde(rename = "scenarioPath")]
    pub scenario_path: String,
    pub status: ExitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<EpisodeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub status: ExitStatus,
    #[serde(rename = "runId")]
    pub run_id: String,
    pub passed: u64,
    pub errored: u64,
    pub entries: Vec<BatchEntry>,
    #[serde(rename = "reportPath", skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
}

impl BatchSummary {
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "status={:?} runId={} passed={} errored={}\n",
            self.status, self.run_id, self.passed, self.errored
        ));
        for entry in &self.entries {
            match (&entry.summary, &entry.error) {
                (Some(s), _) => out.push_str(&format!(
                    "- {} {:?} steps={} total={:.2}\n",
                    entry.scenario_path, entry.status, s.steps, s.total_reward
                )),
                (None, Some(err)) => {
                    out.push_str(&format!("- {} {:?}: {err}\n", entry.scenario_path, entry.status))
                }
                (None, None) => {
                    out.push_str(&format!("- {} {:?}\n", entry.scenario_path, entry.status))
                }
            }
        }
        if let Some(path) = &self.report_path {
            out.push_str(&format!("report={path}\n"));
        }
        out.trim_end().to_string()
    }
}

pub fn write_report<T: Serialize>(report: &T, artifacts_dir: &Path) -> SimResult<PathBuf> {
    std::fs::create_dir_all(artifacts_dir)?;
    let out = artifacts_dir.join("report.json");
    std::fs::write(&out, serde_json::to_vec_pretty(report)?)?;
    Ok(out)
}

/// Wall-clock timestamp for report metadata only; never feeds the simulation.
pub fn wall_time_iso_utc() -> String {
    let dt: time::OffsetDateTime = SystemTime::now().into();
    dt.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
