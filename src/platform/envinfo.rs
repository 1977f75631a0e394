//! Version metadata for `dfasim version` and trace headers.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_date: Option<String>,
}

pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        commit: option_env!("DFASIM_COMMIT").map(|s| s.to_string()),
        build_date: option_env!("DFASIM_BUILD_DATE").map(|s| s.to_string()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvInfo {
    pub os: String,
    pub arch: String,
    pub dfasim: VersionInfo,
    /// Policy names accepted by `--red` / `--blue`.
    pub policies: Vec<String>,
}

pub fn env_info() -> EnvInfo {
    EnvInfo {
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        dfasim: version_info(),
        policies: crate::policy_catalog()
            .into_iter()
            .map(|entry| entry.name)
            .collect(),
    }
}
