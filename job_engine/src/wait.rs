//! Completion waiter.
//!
//! A Docker-like engine offers two independent "finished" signals: the
//! wait call and the deletion of an auto-removed container. A container
//! can exit and be deleted between start and the wait call, in which case
//! the wait call reports "not found" for a job that actually finished.
//!
//! Resolution order, checked on every wake-up:
//! 1. caller cancellation wins and returns [`JobError::Canceled`];
//! 2. a wait result is trusted for the exit code, including "not found",
//!    which means the container already reached its auto-removed state;
//! 3. a removal notice ends the wait with the exit code from the engine's
//!    exit event when it was seen, otherwise 0.
//!
//! If the removal watcher itself fails the wait call alone decides.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use container_engine_interface::{ContainerEngine, WaitCondition};
use harness_shared_types::{ExitSource, JobError, JobStage};

/// How a container reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub exit_code: i64,
    pub exit_source: ExitSource,
    /// The engine already deleted the container; cleanup can be skipped.
    pub already_removed: bool,
}

pub struct CompletionWaiter<'a> {
    engine: &'a dyn ContainerEngine,
}

impl<'a> CompletionWaiter<'a> {
    pub fn new(engine: &'a dyn ContainerEngine) -> Self {
        Self { engine }
    }

    /// Block until `container_id` is terminal or `cancel` fires.
    ///
    /// With `auto_remove` the wait targets removal, so a successful return
    /// means the container no longer exists.
    pub async fn wait(
        &self,
        cancel: &CancellationToken,
        container_id: &str,
        auto_remove: bool,
    ) -> Result<Completion, JobError> {
        let condition = if auto_remove {
            WaitCondition::Removed
        } else {
            WaitCondition::NotRunning
        };

        let wait = self.engine.wait_container(container_id, condition);
        let removed = self.engine.wait_removed(container_id);
        tokio::pin!(wait);
        tokio::pin!(removed);
        let mut watching_removal = true;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(container_id, "Wait canceled by caller");
                    return Err(JobError::Canceled { stage: JobStage::Running });
                }

                outcome = &mut wait => {
                    return match outcome {
                        Ok(outcome) => match outcome.error {
                            Some(message) => Err(JobError::Wait {
                                id: container_id.to_string(),
                                message,
                            }),
                            None => Ok(Completion {
                                exit_code: outcome.status_code,
                                exit_source: ExitSource::Wait,
                                already_removed: auto_remove,
                            }),
                        },
                        Err(e) if e.is_not_found() => {
                            warn!(
                                container_id,
                                "Container was removed before the wait call observed it; treating as exited 0"
                            );
                            Ok(Completion {
                                exit_code: 0,
                                exit_source: ExitSource::AssumedAfterRemoval,
                                already_removed: true,
                            })
                        }
                        Err(e) => Err(JobError::Wait {
                            id: container_id.to_string(),
                            message: e.to_string(),
                        }),
                    };
                }

                notice = &mut removed, if watching_removal => {
                    match notice {
                        Ok(notice) => {
                            let (exit_code, exit_source) = match notice.exit_code {
                                Some(code) => (code, ExitSource::RemovalEvent),
                                None => (0, ExitSource::AssumedAfterRemoval),
                            };
                            warn!(
                                container_id,
                                exit_code,
                                "Container auto-removed before the wait call resolved"
                            );
                            return Ok(Completion {
                                exit_code,
                                exit_source,
                                already_removed: true,
                            });
                        }
                        Err(e) => {
                            debug!(container_id, error = %e, "Removal watcher ended; relying on wait call");
                            watching_removal = false;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(all(test, feature = "mock-engine"))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::{JobScript, MockEngine};
    use crate::scope::RunScope;
    use crate::spec::{self, ContainerOptions};
    use harness_shared_types::ImageRef;

    async fn started(engine: &MockEngine, cmd: &str, auto_remove: bool) -> String {
        let spec = spec::build(
            ImageRef::new("busybox", "stable"),
            vec![cmd.to_string()],
            ContainerOptions::for_scope(&RunScope::new("TestWaiter")).auto_remove(auto_remove),
        )
        .unwrap();
        engine.add_image(&spec.image);
        let id = engine
            .create_container(&crate::naming::container_name("t", "wait"), &spec)
            .await
            .unwrap();
        engine.start_container(&id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_normal_exit_reports_code() {
        let engine = MockEngine::new();
        engine.on_command("exit 3", JobScript::exit(3).running_for(Duration::from_millis(20)));
        let id = started(&engine, "exit 3", false).await;

        let completion = CompletionWaiter::new(&engine)
            .wait(&CancellationToken::new(), &id, false)
            .await
            .unwrap();
        assert_eq!(completion.exit_code, 3);
        assert_eq!(completion.exit_source, ExitSource::Wait);
        assert!(!completion.already_removed);
    }

    #[tokio::test]
    async fn test_not_found_race_is_success() {
        let engine = MockEngine::new();
        engine.on_command("exit 0", JobScript::exit(0).removed_before_wait());
        let id = started(&engine, "exit 0", true).await;

        let completion = CompletionWaiter::new(&engine)
            .wait(&CancellationToken::new(), &id, true)
            .await
            .unwrap();
        assert_eq!(completion.exit_code, 0);
        assert_eq!(completion.exit_source, ExitSource::AssumedAfterRemoval);
        assert!(completion.already_removed);
    }

    #[tokio::test]
    async fn test_removal_notice_carries_exit_code() {
        let engine = MockEngine::new();
        engine.on_command("exit 5", JobScript::exit(5).removal_before_wait_result());
        let id = started(&engine, "exit 5", true).await;

        let completion = CompletionWaiter::new(&engine)
            .wait(&CancellationToken::new(), &id, true)
            .await
            .unwrap();
        assert_eq!(completion.exit_code, 5);
        assert_eq!(completion.exit_source, ExitSource::RemovalEvent);
        assert!(completion.already_removed);
    }

    #[tokio::test]
    async fn test_engine_error_in_wait_result() {
        let engine = MockEngine::new();
        engine.on_command("boom", JobScript::exit(137).wait_error("container killed by OOM"));
        let id = started(&engine, "boom", false).await;

        let err = CompletionWaiter::new(&engine)
            .wait(&CancellationToken::new(), &id, false)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Wait { ref message, .. } if message.contains("OOM")));
    }

    #[tokio::test]
    async fn test_cancel_returns_immediately() {
        let engine = MockEngine::new();
        engine.on_command("sleep", JobScript::never_exits());
        let id = started(&engine, "sleep", true).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = CompletionWaiter::new(&engine)
            .wait(&cancel, &id, true)
            .await
            .unwrap_err();
        assert!(err.is_canceled());
        assert!(engine.inspect_container(&id).await.unwrap().is_some());
    }
}
