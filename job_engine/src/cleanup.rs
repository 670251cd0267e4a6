//! Cleanup supervisor.
//!
//! Removal failures are logged as [`CleanupWarning`]s and never replace a
//! job's own outcome. Containers that slip through are still labelled, so
//! a later label sweep finds them.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use container_engine_interface::{ContainerEngine, EngineResult};
use harness_shared_types::{CleanupWarning, ContainerSpec, EngineError};

/// Result of one cleanup attempt.
#[derive(Debug, Clone)]
pub enum CleanupOutcome {
    /// The engine had already removed the container.
    Skipped,
    Removed,
    /// Removal raced with something else that removed it first.
    AlreadyGone,
    Failed(CleanupWarning),
}

impl CleanupOutcome {
    /// Whether the container is known to be gone.
    pub fn is_clean(&self) -> bool {
        !matches!(self, CleanupOutcome::Failed(_))
    }
}

pub struct CleanupSupervisor {
    engine: Arc<dyn ContainerEngine>,
    timeout: Duration,
}

impl CleanupSupervisor {
    pub fn new(engine: Arc<dyn ContainerEngine>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    /// Force-remove `container_id` unless the engine already did.
    ///
    /// Runs under its own deadline, not the caller's, so it still works
    /// after the caller canceled.
    pub async fn cleanup(&self, container_id: &str, already_removed: bool) -> CleanupOutcome {
        if already_removed {
            debug!(container_id, "Container already removed, skipping cleanup");
            return CleanupOutcome::Skipped;
        }

        let result = tokio::time::timeout(self.timeout, self.engine.remove_container(container_id, true))
            .await
            .unwrap_or_else(|_| {
                Err(EngineError::Transport(format!(
                    "removal timed out after {:?}",
                    self.timeout
                )))
            });

        match result {
            Ok(()) => {
                debug!(container_id, "Container removed");
                CleanupOutcome::Removed
            }
            Err(e) if e.is_not_found() => {
                debug!(container_id, "Container already gone during cleanup");
                CleanupOutcome::AlreadyGone
            }
            Err(source) => {
                let warning = CleanupWarning {
                    container_id: container_id.to_string(),
                    source,
                };
                warn!(container_id, error = %warning, "Failed to remove container");
                CleanupOutcome::Failed(warning)
            }
        }
    }
}

enum GuardTarget {
    /// The create call is in flight; whatever it produces is ours.
    Creating(JoinHandle<EngineResult<String>>),
    Created(String),
}

/// Removes a container if the owning run future is dropped before it
/// reaches its own cleanup step.
pub(crate) struct CleanupGuard {
    engine: Arc<dyn ContainerEngine>,
    target: Option<GuardTarget>,
}

impl CleanupGuard {
    /// Issue the create call on its own task and guard its result.
    ///
    /// A create request lands on the engine whether or not anyone still
    /// waits for it, so the call runs detached and the guard keeps its
    /// answer.
    pub(crate) fn create(engine: Arc<dyn ContainerEngine>, name: &str, spec: &ContainerSpec) -> Self {
        let task = {
            let engine = engine.clone();
            let name = name.to_string();
            let spec = spec.clone();
            tokio::spawn(async move { engine.create_container(&name, &spec).await })
        };
        Self {
            engine,
            target: Some(GuardTarget::Creating(task)),
        }
    }

    /// Wait for the create call to answer. May be called again after a
    /// previous call was dropped mid-wait.
    pub(crate) async fn created(&mut self) -> EngineResult<String> {
        let result = match self.target.as_mut() {
            Some(GuardTarget::Creating(task)) => task.await.unwrap_or_else(|e| {
                Err(EngineError::Transport(format!("create task failed: {}", e)))
            }),
            Some(GuardTarget::Created(id)) => return Ok(id.clone()),
            None => {
                return Err(EngineError::Transport(
                    "container guard already released".to_string(),
                ))
            }
        };
        // A failed create left nothing behind.
        self.target = result.as_ref().ok().map(|id| GuardTarget::Created(id.clone()));
        result
    }

    /// Stop guarding; the caller has removed the container itself.
    pub(crate) fn release(&mut self) {
        self.target = None;
    }

    /// Hand responsibility back to the explicit cleanup step.
    pub(crate) fn disarm(mut self) {
        self.release();
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(target) = self.target.take() else {
            return;
        };

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                if let GuardTarget::Created(container_id) = &target {
                    warn!(
                        container_id = %container_id,
                        "Job dropped outside a runtime; container left for the label sweep"
                    );
                }
                return;
            }
        };

        let engine = self.engine.clone();
        match &target {
            GuardTarget::Created(container_id) => {
                warn!(container_id = %container_id, "Job dropped mid-run, removing container in background")
            }
            GuardTarget::Creating(_) => warn!("Job dropped during create, removing container once it lands"),
        }
        handle.spawn(async move {
            let container_id = match target {
                GuardTarget::Created(id) => id,
                GuardTarget::Creating(task) => match task.await {
                    Ok(Ok(id)) => id,
                    _ => return,
                },
            };
            match engine.remove_container(&container_id, true).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(container_id = %container_id, error = %e, "Background removal failed")
                }
            }
        });
    }
}
