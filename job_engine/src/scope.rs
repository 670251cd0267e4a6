//! Run scopes: the label namespace every resource of one test lives in.

use std::collections::BTreeMap;

use tracing::info;
use uuid::Uuid;

use container_engine_interface::ContainerEngine;
use harness_shared_types::{EngineError, CLEANUP_LABEL, RUN_ID_LABEL};

use crate::naming::{random_lowercase, sanitize_container_name};
use crate::sweep::{LabelSweeper, SweepReport};

/// Label namespace of one test run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunScope {
    name: String,
    run_id: Uuid,
}

impl RunScope {
    /// Scope for `test_name`, e.g. `TestFileRetriever/nested file`.
    pub fn new(test_name: &str) -> Self {
        Self {
            name: sanitize_container_name(test_name),
            run_id: Uuid::new_v4(),
        }
    }

    /// Value of the cleanup label.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Labels every resource of this scope carries.
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (CLEANUP_LABEL.to_string(), self.name.clone()),
            (RUN_ID_LABEL.to_string(), self.run_id.to_string()),
        ])
    }

    /// Sweep leftovers of an earlier run with the same name, then create a
    /// labelled network for this run. Returns the network id.
    pub async fn setup(&self, engine: &dyn ContainerEngine) -> Result<String, EngineError> {
        let report = LabelSweeper::new(engine).sweep(&self.name).await;
        if !report.is_empty() {
            info!(scope = %self.name, "Removed leftovers from a previous run: {}", report);
        }

        let network_name = format!("harness-{}", random_lowercase(8));
        let network_id = engine.create_network(&network_name, &self.labels()).await?;
        info!(scope = %self.name, network = %network_name, "Created network");
        Ok(network_id)
    }

    /// Remove everything labelled with this scope.
    pub async fn teardown(&self, engine: &dyn ContainerEngine) -> SweepReport {
        LabelSweeper::new(engine).sweep(&self.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_labels() {
        let scope = RunScope::new("TestFileRetriever/nested file");
        assert_eq!(scope.name(), "TestFileRetriever_nested_file");

        let labels = scope.labels();
        assert_eq!(labels[CLEANUP_LABEL], "TestFileRetriever_nested_file");
        assert_eq!(labels[RUN_ID_LABEL], scope.run_id().to_string());
    }

    #[test]
    fn test_scopes_get_distinct_run_ids() {
        assert_ne!(RunScope::new("TestA").run_id(), RunScope::new("TestA").run_id());
    }

    #[cfg(feature = "mock-engine")]
    #[tokio::test]
    async fn test_setup_sweeps_then_creates_network() {
        use crate::mock::MockEngine;
        use container_engine_interface::LabelFilter;

        let engine = MockEngine::new();
        let old = RunScope::new("TestSetup");
        engine.create_network("stale", &old.labels()).await.unwrap();

        let scope = RunScope::new("TestSetup");
        let network_id = scope.setup(&engine).await.unwrap();

        let networks = engine
            .list_networks(&LabelFilter::new(CLEANUP_LABEL, "TestSetup"))
            .await
            .unwrap();
        assert_eq!(networks, vec![network_id]);

        let report = scope.teardown(&engine).await;
        assert_eq!(report.networks_removed, 1);
    }
}
