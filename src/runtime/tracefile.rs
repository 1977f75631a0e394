//! Episode trace file format read/write.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

use crate::{
    AgentStateChange, EngineOptions, EpisodeSummary, Scenario, Side, SimError, SimResult,
    TraceRecord, VersionInfo,
};

pub const TRACE_FORMAT: &str = "dfasim-trace";
pub const CURRENT_TRACE_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct TracePath {
    path: PathBuf,
}

impl TracePath {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCollisionPolicy {
    Error,
    Overwrite,
    Append,
}

impl clap::ValueEnum for RecordCollisionPolicy {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Error, Self::Overwrite, Self::Append]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            Self::Error => clap::builder::PossibleValue::new("error"),
            Self::Overwrite => clap::builder::PossibleValue::new("overwrite"),
            Self::Append => clap::builder::PossibleValue::new("append"),
        })
    }
}

/// The move an agent asked for in one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInput {
    pub action: String,
    pub host: usize,
}

/// Everything needed to re-drive and check one engine step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTrace {
    pub index: u64,
    pub first: Side,
    pub actor: StepInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opponent: Option<StepInput>,
    pub records: Vec<TraceRecord>,
    pub observation: Vec<String>,
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceFile {
    pub format: String,
    pub version: u32,
    pub engine: VersionInfo,
    pub scenario_path: Option<String>,
    pub scenario: Scenario,
    pub red_policy: String,
    pub blue_policy: String,
    pub seed: u64,
    pub options: EngineOptions,
    pub initial_observation: Vec<String>,
    pub steps: Vec<StepTrace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_changes: Vec<AgentStateChange>,
    pub summary: EpisodeSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl TraceFile {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scenario_path: Option<String>,
        scenario: Scenario,
        red_policy: String,
        blue_policy: String,
        seed: u64,
        options: EngineOptions,
        initial_observation: Vec<String>,
        steps: Vec<StepTrace>,
        agent_changes: Vec<AgentStateChange>,
        summary: EpisodeSummary,
    ) -> Self {
        Self {
            format: TRACE_FORMAT.to_string(),
            version: CURRENT_TRACE_VERSION,
            engine: crate::version_info(),
            scenario_path,
            scenario,
            red_policy,
            blue_policy,
            seed,
            options,
            initial_observation,
            steps,
            agent_changes,
            summary,
            checksum: None,
        }
    }

    /// Every trace record in step order.
    pub fn records(&self) -> impl Iterator<Item = &TraceRecord> {
        self.steps.iter().flat_map(|s| s.records.iter())
    }

    pub fn write_json(&self, path: &Path) -> SimResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut with_checksum = self.clone();
        with_checksum.checksum = None;
        let canonical = serde_json::to_vec(&with_checksum)?;
        with_checksum.checksum = Some(blake3::hash(&canonical).to_hex().to_string());

        let pretty = std::env::var("DFASIM_TRACE_PRETTY")
            .ok()
            .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        let bytes = if pretty {
            serde_json::to_vec_pretty(&with_checksum)?
        } else {
            serde_json::to_vec(&with_checksum)?
        };
        // write-then-rename so readers never see a partial trace
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("trace.json");
        let tmp_name = format!(
            ".{file_name}.{}.{}.tmp",
            std::process::id(),
            uuid::Uuid::new_v4()
        );
        let tmp_path = parent.join(tmp_name);
        std::fs::write(&tmp_path, bytes)?;
        if let Err(err) = std::fs::rename(&tmp_path, path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(())
    }

    pub fn read_json(path: &Path) -> SimResult<Self> {
        let bytes = std::fs::read(path)?;
        let t: TraceFile = serde_json::from_slice(&bytes).map_err(|e| {
            SimError::Trace(format!("failed to parse trace {}: {e}", path.display()))
        })?;
        if t.format != TRACE_FORMAT {
            return Err(SimError::Trace(format!(
                "{} is not a {TRACE_FORMAT} file (format={:?})",
                path.display(),
                t.format
            )));
        }
        if t.version > CURRENT_TRACE_VERSION {
            return Err(SimError::Trace(format!(
                "trace schema v{} is newer than supported v{CURRENT_TRACE_VERSION}",
                t.version
            )));
        }
        verify_checksum(&t, path)?;
        Ok(t)
    }
}

pub fn write_trace_with_policy(
    trace: &TraceFile,
    requested: &Path,
    policy: RecordCollisionPolicy,
) -> SimResult<PathBuf> {
    let target = resolve_record_target(requested, policy)?;
    let _lock = acquire_record_lock(&target)?;
    trace.write_json(&target)?;
    Ok(target)
}

fn resolve_record_target(path: &Path, policy: RecordCollisionPolicy) -> SimResult<PathBuf> {
    match policy {
        RecordCollisionPolicy::Overwrite => Ok(path.to_path_buf()),
        RecordCollisionPolicy::Error => {
            if path.exists() {
                Err(SimError::Trace(format!(
                    "record collision: {} already exists (--record-collision=error)",
                    path.display()
                )))
            } else {
                Ok(path.to_path_buf())
            }
        }
        RecordCollisionPolicy::Append => {
            if !path.exists() {
                return Ok(path.to_path_buf());
            }
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("trace");
            let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("json");
            for i in 1..=100_000 {
                let candidate = parent.join(format!("{stem}.{i}.{ext}"));
                if !candidate.exists() {
                    return Ok(candidate);
                }
            }
            Err(SimError::Trace(format!(
                "unable to find append target for {}",
                path.display()
            )))
        }
    }
}

struct RecordLockGuard {
    lock_path: PathBuf,
}

impl Drop for RecordLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

fn acquire_record_lock(target: &Path) -> SimResult<RecordLockGuard> {
    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let lock_path = PathBuf::from(format!("{}.lock", target.to_string_lossy()));
    match std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&lock_path)
    {
        Ok(_) => Ok(RecordLockGuard { lock_path }),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(SimError::Trace(format!(
            "record collision: active writer holds lock for {}",
            target.display()
        ))),
        Err(e) => Err(e.into()),
    }
}

fn verify_checksum(trace: &TraceFile, path: &Path) -> SimResult<()> {
    let Some(expected) = trace.checksum.as_ref() else {
        return Ok(());
    };
    let mut canonical = trace.clone();
    canonical.checksum = None;
    let bytes = serde_json::to_vec(&canonical)?;
    let got = blake3::hash(&bytes).to_hex().to_string();
    if &got != expected {
        return Err(SimError::Trace(format!(
            "trace checksum mismatch for {} (expected {}, got {})",
            path.display(),
            expected,
            got
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExitStatus, RunIdentity, RunMode};
    use indexmap::IndexMap;
    use uuid::Uuid;

    fn temp_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dfasim-trace-tests-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        dir.join(name)
    }

    fn sample_trace() -> TraceFile {
        let scenario = Scenario::example().expect("example");
        let summary = EpisodeSummary {
            status: ExitStatus::Pass,
            mode: RunMode::Run,
            identity: RunIdentity {
                run_id: "run-1".to_string(),
                seed: 1,
                trace_path: None,
                report_path: None,
                artifacts_dir: None,
            },
            scenario: scenario.display_name().to_string(),
            scenario_path: None,
            red_policy: "sleep".to_string(),
            blue_policy: "sleep".to_string(),
            steps: 1,
            host_states: vec!["q0".to_string(); 3],
            agent_states: IndexMap::new(),
            rewards: IndexMap::from([(Side::Red, 0.0), (Side::Blue, 0.0)]),
            total_reward: 0.0,
            started_at: "2026-01-01T00:00:00Z".to_string(),
            finished_at: "2026-01-01T00:00:00Z".to_string(),
            duration_ms: 0,
            findings: Vec::new(),
        };
        let record = |agent, action: &str| TraceRecord {
            step: 0,
            agent,
            action: action.to_string(),
            host: 0,
            reward: 0.0,
            success: true,
        };
        TraceFile::new(
            None,
            scenario,
            "sleep".to_string(),
            "sleep".to_string(),
            1,
            EngineOptions::default(),
            vec!["q0".to_string(); 3],
            vec![StepTrace {
                index: 0,
                first: Side::Red,
                actor: StepInput {
                    action: "Sleep".to_string(),
                    host: 0,
                },
                opponent: None,
                records: vec![record(Side::Red, "Sleep"), record(Side::Blue, "NoOp")],
                observation: vec!["q0".to_string(); 3],
                done: false,
            }],
            Vec::new(),
            summary,
        )
    }

    #[test]
    fn written_trace_reads_back_with_valid_checksum() {
        let path = temp_file("trace.json");
        let trace = sample_trace();
        trace.write_json(&path).expect("write");
        let loaded = TraceFile::read_json(&path).expect("read");
        assert!(loaded.checksum.is_some());
        assert_eq!(loaded.format, TRACE_FORMAT);
        assert_eq!(loaded.records().count(), 2);
        assert_eq!(loaded.steps, trace.steps);
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let path = temp_file("bad.json");
        sample_trace().write_json(&path).expect("write");
        let mut value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        value["seed"] = serde_json::json!(99);
        std::fs::write(&path, serde_json::to_vec(&value).expect("encode")).expect("write");
        let err = TraceFile::read_json(&path).expect_err("must reject checksum mismatch");
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn foreign_format_is_rejected() {
        let path = temp_file("other.json");
        let mut trace = sample_trace();
        trace.format = "something-else".to_string();
        trace.write_json(&path).expect("write");
        let err = TraceFile::read_json(&path).expect_err("must fail");
        assert!(err.to_string().contains("not a dfasim-trace file"));
    }

    #[test]
    fn record_collision_error_policy_rejects_existing_target() {
        let path = temp_file("exists.json");
        std::fs::write(&path, b"old").expect("write existing");
        let err = write_trace_with_policy(&sample_trace(), &path, RecordCollisionPolicy::Error)
            .expect_err("must fail");
        assert!(err.to_string().contains("record collision"));
    }

    #[test]
    fn record_collision_append_policy_picks_numbered_path() {
        let path = temp_file("trace.json");
        std::fs::write(&path, b"old").expect("write existing");
        let out = write_trace_with_policy(&sample_trace(), &path, RecordCollisionPolicy::Append)
            .expect("append");
        assert_ne!(out, path);
        assert!(out.to_string_lossy().ends_with("trace.1.json"));
        let loaded = TraceFile::read_json(&out).expect("trace exists");
        assert_eq!(loaded.red_policy, "sleep");
        assert!(!PathBuf::from(format!("{}.lock", out.display())).exists());
    }

    #[test]
    fn failed_rename_leaves_no_temp_file() {
        let path = temp_file("occupied");
        // a non-empty directory at the target makes the rename fail
        std::fs::create_dir_all(path.join("inner")).expect("occupy target");
        sample_trace().write_json(&path).expect_err("rename onto a directory must fail");
        let parent = path.parent().expect("parent");
        let leftovers: Vec<_> = std::fs::read_dir(parent)
            .expect("list parent")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }

    #[test]
    fn truncated_trace_is_rejected() {
        let path = temp_file("truncated.json");
        std::fs::write(&path, br#"{"format":"dfasim-trace""#).expect("write");
        let err = TraceFile::read_json(&path).expect_err("must fail");
        assert!(err.to_string().contains("failed to parse trace"));
    }
}
