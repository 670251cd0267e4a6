//! Job engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use harness_shared_types::ImageRef;

/// When the image cache may pull from a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    /// Pull only when the image is not present locally.
    #[default]
    IfMissing,
    /// Pull once per process even if a local copy exists.
    Always,
    /// Never pull; a missing image is a pull error.
    Never,
}

/// Configuration for [`crate::JobRunner`] and its helpers.
#[derive(Debug, Clone)]
pub struct JobEngineConfig {
    /// Prefix of every generated container name (default: "harness").
    pub name_prefix: String,
    pub pull_policy: PullPolicy,
    /// Cap on captured stdout + stderr. `None` keeps everything.
    pub max_output_bytes: Option<usize>,
    /// How long to keep reading output after the container finished (default: 5s).
    pub output_drain_timeout: Duration,
    /// Deadline for a forced removal during cleanup (default: 30s).
    pub cleanup_timeout: Duration,
    /// Small image with a shell, used for volume and file helpers.
    pub helper_image: ImageRef,
}

impl Default for JobEngineConfig {
    fn default() -> Self {
        Self {
            name_prefix: "harness".to_string(),
            pull_policy: PullPolicy::IfMissing,
            max_output_bytes: None,
            output_drain_timeout: Duration::from_secs(5),
            cleanup_timeout: Duration::from_secs(30),
            helper_image: ImageRef::new("busybox", "stable"),
        }
    }
}

/// Connection settings for [`crate::DockerEngine`].
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Unix socket to connect to. `None` uses `DOCKER_HOST` or the platform default.
    pub socket: Option<PathBuf>,
    /// Per-request timeout in seconds (default: 120).
    pub timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: None,
            timeout_secs: 120,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = JobEngineConfig::default();
        assert_eq!(config.name_prefix, "harness");
        assert_eq!(config.pull_policy, PullPolicy::IfMissing);
        assert_eq!(config.max_output_bytes, None);
        assert_eq!(config.cleanup_timeout, Duration::from_secs(30));
        assert_eq!(config.helper_image.to_string(), "busybox:stable");
    }

    #[test]
    fn test_docker_config_default() {
        let config = DockerConfig::default();
        assert!(config.socket.is_none());
        assert_eq!(config.timeout_secs, 120);
    }
}
