//! `dfasim.toml` config loading.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

use crate::{DEFAULT_MAX_STEPS, EngineOptions, RecordCollisionPolicy, Reporter};

pub const DEFAULT_CONFIG_FILE: &str = "dfasim.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Base directory for run artifacts.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Default reporter for CLI commands.
    #[serde(default = "default_reporter")]
    pub reporter: Reporter,

    /// Episode step budget when the command line does not give one.
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,

    /// Forces agent states in or out of observations. Unset means automatic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observe_agent_states: Option<bool>,

    /// What `--record` does when the target trace already exists.
    #[serde(default = "default_record_collision")]
    pub record_collision: RecordCollisionPolicy,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".dfasim")
}

fn default_reporter() -> Reporter {
    Reporter::Pretty
}

fn default_max_steps() -> u64 {
    DEFAULT_MAX_STEPS
}

fn default_record_collision() -> RecordCollisionPolicy {
    RecordCollisionPolicy::Error
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            reporter: default_reporter(),
            max_steps: default_max_steps(),
            observe_agent_states: None,
            record_collision: default_record_collision(),
        }
    }
}

impl Config {
    pub fn load_optional(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<Config>(&s) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!("failed to parse config {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                tracing::warn!("failed to read config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.base_dir.join("runs")
    }

    pub fn engine_options(&self, max_steps: Option<u64>) -> EngineOptions {
        EngineOptions {
            max_steps: max_steps.unwrap_or(self.max_steps),
            observe_agent_states: self.observe_agent_states,
        }
    }
}
