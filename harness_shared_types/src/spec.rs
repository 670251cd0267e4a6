//! Launch descriptor for one ephemeral container.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::image::ImageRef;

/// Label whose value names the owning test scope. Sweeps key on it.
pub const CLEANUP_LABEL: &str = "harness.cleanup";

/// Label whose value identifies one run of a scope.
pub const RUN_ID_LABEL: &str = "harness.run-id";

/// User string for root inside a container.
pub const ROOT_USER: &str = "0:0";

/// A volume or host path bound into a container.
///
/// Rendered as `<source>:<target>[:mode]` and passed to the engine as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
    pub source: String,
    pub target: String,
    pub mode: Option<String>,
}

impl Bind {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            mode: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.mode = Some("ro".to_string());
        self
    }

    /// Split `<source>:<target>[:mode]`. Only non-emptiness is checked;
    /// mount semantics are left to the engine.
    pub fn parse(raw: &str) -> Result<Self, JobError> {
        let mut parts = raw.splitn(3, ':');
        let source = parts.next().unwrap_or_default();
        let target = parts.next().unwrap_or_default();
        let mode = parts.next().map(str::to_string);

        if source.is_empty() || target.is_empty() {
            return Err(JobError::InvalidSpec(format!(
                "bind must be <source>:<target>[:mode], got {:?}",
                raw
            )));
        }
        if matches!(mode.as_deref(), Some("")) {
            return Err(JobError::InvalidSpec(format!("bind {:?} has an empty mode", raw)));
        }

        Ok(Self {
            source: source.to_string(),
            target: target.to_string(),
            mode,
        })
    }
}

impl fmt::Display for Bind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mode {
            Some(mode) => write!(f, "{}:{}:{}", self.source, self.target, mode),
            None => write!(f, "{}:{}", self.source, self.target),
        }
    }
}

/// Everything needed to create one job container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Short purpose used in the generated container name.
    pub job_name: String,
    pub image: ImageRef,
    /// Empty means the image's own entrypoint.
    pub entrypoint: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub binds: Vec<Bind>,
    /// `uid[:gid]`, or empty for the image default.
    pub user: String,
    pub labels: BTreeMap<String, String>,
    pub network_id: Option<String>,
    pub hostname: Option<String>,
    /// Let the engine delete the container once it exits.
    pub auto_remove: bool,
}

impl ContainerSpec {
    /// Environment in `KEY=VALUE` form.
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    pub fn bind_list(&self) -> Vec<String> {
        self.binds.iter().map(ToString::to_string).collect()
    }

    /// Value of the cleanup label, if present.
    pub fn cleanup_scope(&self) -> Option<&str> {
        self.labels.get(CLEANUP_LABEL).map(String::as_str)
    }
}
