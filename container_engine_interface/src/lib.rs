//! Interface to a Docker-like container engine.
//!
//! The job engine only talks to containers through [`ContainerEngine`].
//! Implementations must be cheap to share (`Arc<dyn ContainerEngine>`) and
//! safe to call from many concurrent job runs.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

pub use harness_shared_types::{ContainerSpec, EngineError, ImageRef};

/// Result type for engine calls.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Condition a wait call blocks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitCondition {
    /// The container process has exited.
    NotRunning,
    /// The container has exited and been deleted.
    Removed,
}

impl WaitCondition {
    /// Engine API spelling of the condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitCondition::NotRunning => "not-running",
            WaitCondition::Removed => "removed",
        }
    }
}

/// Terminal status reported by a wait call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOutcome {
    pub status_code: i64,
    /// Engine-internal error attached to the terminal status. A non-zero
    /// exit on its own is not an error.
    pub error: Option<String>,
}

impl WaitOutcome {
    pub fn exited(status_code: i64) -> Self {
        Self { status_code, error: None }
    }
}

/// Signal that a container was deleted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalNotice {
    /// Exit code from the container's exit event, when it was observed.
    pub exit_code: Option<i64>,
}

/// One chunk of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Combined stdout/stderr of an attached container. Ends when the
/// container's process exits.
pub type OutputStream = Pin<Box<dyn Stream<Item = EngineResult<OutputChunk>> + Send>>;

/// Key/value label selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabelFilter {
    pub key: String,
    pub value: String,
}

impl LabelFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Engine filter spelling: `key=value`.
    pub fn to_filter(&self) -> String {
        format!("{}={}", self.key, self.value)
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.get(&self.key) == Some(&self.value)
    }
}

/// Summary of an existing container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub running: bool,
}

/// Operations the job engine needs from a container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    // ==================== Images ====================

    /// Whether the image is present locally.
    async fn image_exists(&self, image: &ImageRef) -> EngineResult<bool>;

    /// Pull the image. Retries, if any, belong to the implementation.
    async fn pull_image(&self, image: &ImageRef) -> EngineResult<()>;

    // ==================== Containers ====================

    /// Create a container named `name` and return its id.
    async fn create_container(&self, name: &str, spec: &ContainerSpec) -> EngineResult<String>;

    /// Attach to stdout/stderr. Called before start so no output is lost
    /// when the container is auto-removed.
    async fn attach_container(&self, id: &str) -> EngineResult<OutputStream>;

    async fn start_container(&self, id: &str) -> EngineResult<()>;

    /// Block until the container meets `condition`.
    async fn wait_container(&self, id: &str, condition: WaitCondition) -> EngineResult<WaitOutcome>;

    /// Resolve once the engine deletes the container.
    async fn wait_removed(&self, id: &str) -> EngineResult<RemovalNotice>;

    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()>;

    /// Look up a container by id or name. `Ok(None)` when it does not exist.
    async fn inspect_container(&self, id_or_name: &str) -> EngineResult<Option<ContainerInfo>>;

    /// All containers, running or not, carrying the label.
    async fn list_containers(&self, filter: &LabelFilter) -> EngineResult<Vec<ContainerInfo>>;

    // ==================== Volumes & networks ====================

    async fn create_volume(&self, name: &str, labels: &BTreeMap<String, String>) -> EngineResult<String>;

    async fn list_volumes(&self, filter: &LabelFilter) -> EngineResult<Vec<String>>;

    async fn remove_volume(&self, name: &str) -> EngineResult<()>;

    async fn create_network(&self, name: &str, labels: &BTreeMap<String, String>) -> EngineResult<String>;

    async fn list_networks(&self, filter: &LabelFilter) -> EngineResult<Vec<String>>;

    async fn remove_network(&self, id: &str) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_condition_spelling() {
        assert_eq!(WaitCondition::NotRunning.as_str(), "not-running");
        assert_eq!(WaitCondition::Removed.as_str(), "removed");
    }

    #[test]
    fn test_label_filter_matches() {
        let filter = LabelFilter::new("harness.cleanup", "TestFoo");
        assert_eq!(filter.to_filter(), "harness.cleanup=TestFoo");

        let mut labels = BTreeMap::new();
        assert!(!filter.matches(&labels));
        labels.insert("harness.cleanup".to_string(), "TestFoo".to_string());
        assert!(filter.matches(&labels));
        labels.insert("harness.cleanup".to_string(), "TestBar".to_string());
        assert!(!filter.matches(&labels));
    }
}
