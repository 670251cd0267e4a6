//! Optional TOML config file.
//!
//! ```toml
//! [engine]
//! name_prefix = "harness"
//! pull_policy = "if-missing"
//! max_output_bytes = 1048576
//! helper_image = "busybox:stable"
//!
//! [docker]
//! socket = "/var/run/docker.sock"
//!
//! [logging]
//! filter = "info,job_engine=debug"
//! format = "json"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use job_engine::{DockerConfig, ImageRef, JobEngineConfig, PullPolicy};
use observability::TracingConfig;

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub engine: EngineSection,
    pub docker: DockerSection,
    pub logging: TracingConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSection {
    pub name_prefix: Option<String>,
    pub pull_policy: Option<PullPolicy>,
    pub max_output_bytes: Option<usize>,
    pub output_drain_timeout_secs: Option<u64>,
    pub cleanup_timeout_secs: Option<u64>,
    pub helper_image: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerSection {
    pub socket: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
}

/// `<config_dir>/chain-harness/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("chain-harness").join("config.toml"))
}

impl HarnessConfig {
    /// Load `explicit` if given (it must exist), else the default path if
    /// present, else built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn engine_config(&self) -> Result<JobEngineConfig> {
        let defaults = JobEngineConfig::default();
        let section = &self.engine;

        let helper_image = match &section.helper_image {
            Some(raw) => ImageRef::parse(raw).with_context(|| format!("Invalid helper_image {:?}", raw))?,
            None => defaults.helper_image,
        };

        Ok(JobEngineConfig {
            name_prefix: section.name_prefix.clone().unwrap_or(defaults.name_prefix),
            pull_policy: section.pull_policy.unwrap_or(defaults.pull_policy),
            max_output_bytes: section.max_output_bytes.or(defaults.max_output_bytes),
            output_drain_timeout: section
                .output_drain_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.output_drain_timeout),
            cleanup_timeout: section
                .cleanup_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.cleanup_timeout),
            helper_image,
        })
    }

    pub fn docker_config(&self) -> DockerConfig {
        let defaults = DockerConfig::default();
        DockerConfig {
            socket: self.docker.socket.clone().or(defaults.socket),
            timeout_secs: self.docker.timeout_secs.unwrap_or(defaults.timeout_secs),
        }
    }
}
