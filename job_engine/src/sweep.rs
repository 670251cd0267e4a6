//! Label-based garbage collection.
//!
//! The safety net for processes that died before in-process cleanup ran:
//! everything carrying `harness.cleanup=<scope>` is force-removed.

use std::fmt;

use tracing::{debug, warn};

use container_engine_interface::{ContainerEngine, LabelFilter};
use harness_shared_types::{EngineError, CLEANUP_LABEL};

/// What a sweep removed and what it could not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub containers_removed: usize,
    pub volumes_removed: usize,
    pub networks_removed: usize,
    pub failures: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.containers_removed == 0
            && self.volumes_removed == 0
            && self.networks_removed == 0
            && self.failures.is_empty()
    }

    fn record_failure(&mut self, kind: &str, id: &str, err: &EngineError) {
        warn!(kind, id, error = %err, "Sweep failed to remove resource");
        self.failures.push(format!("{} {}: {}", kind, id, err));
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} container(s), {} volume(s), {} network(s) removed, {} failure(s)",
            self.containers_removed,
            self.volumes_removed,
            self.networks_removed,
            self.failures.len()
        )
    }
}

/// Removes all resources of a scope. Containers go first so volumes and
/// networks are no longer in use when their turn comes.
pub struct LabelSweeper<'a> {
    engine: &'a dyn ContainerEngine,
}

impl<'a> LabelSweeper<'a> {
    pub fn new(engine: &'a dyn ContainerEngine) -> Self {
        Self { engine }
    }

    pub async fn sweep(&self, scope: &str) -> SweepReport {
        let filter = LabelFilter::new(CLEANUP_LABEL, scope);
        let mut report = SweepReport::default();

        match self.engine.list_containers(&filter).await {
            Ok(containers) => {
                for container in containers {
                    match self.engine.remove_container(&container.id, true).await {
                        Ok(()) => report.containers_removed += 1,
                        Err(e) if e.is_not_found() => {}
                        Err(e) => report.record_failure("container", &container.id, &e),
                    }
                }
            }
            Err(e) => report.record_failure("container", "<list>", &e),
        }

        match self.engine.list_volumes(&filter).await {
            Ok(volumes) => {
                for volume in volumes {
                    match self.engine.remove_volume(&volume).await {
                        Ok(()) => report.volumes_removed += 1,
                        Err(e) if e.is_not_found() => {}
                        Err(e) => report.record_failure("volume", &volume, &e),
                    }
                }
            }
            Err(e) => report.record_failure("volume", "<list>", &e),
        }

        match self.engine.list_networks(&filter).await {
            Ok(networks) => {
                for network in networks {
                    match self.engine.remove_network(&network).await {
                        Ok(()) => report.networks_removed += 1,
                        Err(e) if e.is_not_found() => {}
                        Err(e) => report.record_failure("network", &network, &e),
                    }
                }
            }
            Err(e) => report.record_failure("network", "<list>", &e),
        }

        debug!(scope, "Sweep finished: {}", report);
        report
    }
}

#[cfg(all(test, feature = "mock-engine"))]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::mock::{JobScript, MockEngine};
    use crate::scope::RunScope;
    use crate::spec::{self, ContainerOptions};
    use harness_shared_types::ImageRef;

    #[tokio::test]
    async fn test_sweep_removes_only_scope_resources() {
        let engine = Arc::new(MockEngine::new());
        let scope = RunScope::new("TestSweep");
        let other = RunScope::new("TestOther");

        engine.add_image(&ImageRef::new("busybox", "stable"));
        engine.on_command("sleep 1000", JobScript::never_exits());
        for s in [&scope, &other] {
            let spec = spec::build(
                ImageRef::new("busybox", "stable"),
                vec!["sleep 1000".to_string()],
                ContainerOptions::for_scope(s),
            )
            .unwrap();
            let id = engine.create_container(&format!("c-{}", s.name()), &spec).await.unwrap();
            engine.start_container(&id).await.unwrap();
            engine.create_volume(&format!("vol-{}", s.name()), &s.labels()).await.unwrap();
            engine.create_network(&format!("net-{}", s.name()), &s.labels()).await.unwrap();
        }
        engine.create_volume("unlabelled", &BTreeMap::new()).await.unwrap();

        let report = LabelSweeper::new(engine.as_ref()).sweep(scope.name()).await;
        assert_eq!(report.containers_removed, 1);
        assert_eq!(report.volumes_removed, 1);
        assert_eq!(report.networks_removed, 1);
        assert!(report.failures.is_empty());

        let leftover = engine
            .list_containers(&LabelFilter::new(CLEANUP_LABEL, other.name()))
            .await
            .unwrap();
        assert_eq!(leftover.len(), 1);
        assert_eq!(engine.volume_count(), 2);
    }

    #[tokio::test]
    async fn test_sweep_records_failures_and_continues() {
        let engine = MockEngine::new();
        let scope = RunScope::new("TestSweepFailure");
        engine.create_volume("vol-a", &scope.labels()).await.unwrap();
        engine.create_network("net-a", &scope.labels()).await.unwrap();
        engine.fail_volume_removals(true);

        let report = LabelSweeper::new(&engine).sweep(scope.name()).await;
        assert_eq!(report.volumes_removed, 0);
        assert_eq!(report.networks_removed, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].starts_with("volume vol-a"));
    }

    #[test]
    fn test_report_display() {
        let report = SweepReport {
            containers_removed: 2,
            volumes_removed: 1,
            networks_removed: 0,
            failures: vec![],
        };
        assert_eq!(
            report.to_string(),
            "2 container(s), 1 volume(s), 0 network(s) removed, 0 failure(s)"
        );
        assert!(!report.is_empty());
        assert!(SweepReport::default().is_empty());
    }
}
