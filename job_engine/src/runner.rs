//! Job runner: one ephemeral container per call.
//!
//! Stages run strictly in order: image → create → attach → start →
//! (output + wait) → cleanup. Once a container exists, cleanup runs
//! exactly once before `run` returns, whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use container_engine_interface::ContainerEngine;
use harness_shared_types::{ContainerSpec, JobError, JobResult, JobStage, RunningContainer};

use crate::cleanup::{CleanupGuard, CleanupOutcome, CleanupSupervisor};
use crate::config::JobEngineConfig;
use crate::image::ImageCache;
use crate::naming::container_name;
use crate::output::OutputCapture;
use crate::wait::{Completion, CompletionWaiter};

/// A started container that reached a terminal state.
struct Finished {
    completion: Completion,
    container: RunningContainer,
    output: OutputCapture,
    stream_error: Option<JobError>,
}

/// Runs jobs against a shared engine client. Cheap to share across tasks;
/// the image cache is the only state concurrent runs have in common.
pub struct JobRunner {
    engine: Arc<dyn ContainerEngine>,
    images: ImageCache,
    cleanup: CleanupSupervisor,
    config: JobEngineConfig,
}

impl JobRunner {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: JobEngineConfig) -> Self {
        Self {
            images: ImageCache::new(engine.clone(), config.pull_policy),
            cleanup: CleanupSupervisor::new(engine.clone(), config.cleanup_timeout),
            engine,
            config,
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn config(&self) -> &JobEngineConfig {
        &self.config
    }

    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    /// Run `spec` to completion and return its result.
    ///
    /// A non-zero exit code is returned as data. Errors are reserved for
    /// engine failures and cancellation.
    pub async fn run(&self, cancel: &CancellationToken, spec: &ContainerSpec) -> Result<JobResult, JobError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JobError::Canceled { stage: JobStage::PullingImage }),
            ensured = self.images.ensure(&spec.image) => ensured?,
        }

        let name = container_name(&self.config.name_prefix, &spec.job_name);
        let mut guard = CleanupGuard::create(self.engine.clone(), &name, spec);
        let id = self.create(cancel, &mut guard, &name, spec).await?;

        let outcome = self.run_created(cancel, &id, &name, spec).await;

        let already_removed = match &outcome {
            Ok(finished) => finished.completion.already_removed,
            Err(JobError::StartRace { .. }) => true,
            Err(_) => false,
        };
        if let CleanupOutcome::Failed(warning) = self.cleanup.cleanup(&id, already_removed).await {
            debug!(container_id = %id, "Cleanup left container behind: {}", warning);
        }
        guard.disarm();

        let Finished {
            completion,
            container,
            output,
            stream_error,
        } = outcome?;
        let container_error = output.truncation_error().or(stream_error);
        let (stdout, stderr) = output.into_parts();

        info!(
            container = %name,
            exit_code = completion.exit_code,
            "Job finished"
        );

        Ok(JobResult {
            container_id: id,
            container_name: name,
            exit_code: completion.exit_code,
            exit_source: completion.exit_source,
            stdout,
            stderr,
            container_error,
            started_at: container.started_at,
            finished_at: Utc::now(),
        })
    }

    /// Run with a deadline; expiry behaves like cancellation.
    pub async fn run_with_timeout(
        &self,
        cancel: &CancellationToken,
        spec: &ContainerSpec,
        timeout: Duration,
    ) -> Result<JobResult, JobError> {
        let child = cancel.child_token();
        let deadline = child.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            deadline.cancel();
        });

        let result = self.run(&child, spec).await;
        timer.abort();
        result
    }

    async fn create(
        &self,
        cancel: &CancellationToken,
        guard: &mut CleanupGuard,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<String, JobError> {
        tokio::select! {
            biased;
            created = guard.created() => {
                let id = created.map_err(|source| JobError::Create {
                    name: name.to_string(),
                    source,
                })?;
                debug!(container = %name, container_id = %id, image = %spec.image, "Container created");
                Ok(id)
            }
            _ = cancel.cancelled() => {
                // The request is already with the engine. Wait for its answer
                // so the container it creates is the one removed.
                match tokio::time::timeout(self.config.cleanup_timeout, guard.created()).await {
                    Ok(Ok(id)) => {
                        self.cleanup.cleanup(&id, false).await;
                        guard.release();
                    }
                    Ok(Err(_)) => {
                        self.cleanup.cleanup(name, false).await;
                    }
                    Err(_) => {
                        // Still pending: the guard removes it once it lands.
                        warn!(container = %name, "Create still pending after cancel");
                        self.cleanup.cleanup(name, false).await;
                    }
                }
                Err(JobError::Canceled { stage: JobStage::Creating })
            }
        }
    }

    async fn run_created(
        &self,
        cancel: &CancellationToken,
        id: &str,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<Finished, JobError> {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JobError::Canceled { stage: JobStage::Starting }),
            attached = self.engine.attach_container(id) => attached.map_err(|source| JobError::Attach {
                id: id.to_string(),
                source,
            })?,
        };

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(JobError::Canceled { stage: JobStage::Starting }),
            started = self.engine.start_container(id) => started,
        };
        match started {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!(container_id = %id, "Container removed before start could observe it");
                return Err(JobError::StartRace { id: id.to_string() });
            }
            Err(source) => {
                return Err(JobError::Start {
                    id: id.to_string(),
                    source,
                })
            }
        }

        let container = RunningContainer {
            id: id.to_string(),
            name: name.to_string(),
            spec: spec.clone(),
            started_at: Utc::now(),
        };
        debug!(container = %name, "Container started");

        let mut output = OutputCapture::new(self.config.max_output_bytes);
        let mut stream_error = None;
        let waiter = CompletionWaiter::new(self.engine.as_ref());
        let completion = {
            let drain = output.drain(stream);
            tokio::pin!(drain);
            let wait = waiter.wait(cancel, id, spec.auto_remove);
            tokio::pin!(wait);

            let mut drained = false;
            let completion = loop {
                tokio::select! {
                    completion = &mut wait => break completion,
                    result = &mut drain, if !drained => {
                        drained = true;
                        if let Err(e) = result {
                            warn!(container_id = %id, error = %e, "Output stream failed");
                            stream_error = Some(JobError::Output(e.to_string()));
                        }
                    }
                }
            };

            // The stream ends on exit; give it a bounded chance to deliver the tail.
            if completion.is_ok() && !drained {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(container_id = %id, "Canceled while draining output, keeping partial output")
                    }
                    tail = tokio::time::timeout(self.config.output_drain_timeout, &mut drain) => match tail {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(container_id = %id, error = %e, "Output stream failed");
                            stream_error = Some(JobError::Output(e.to_string()));
                        }
                        Err(_) => warn!(container_id = %id, "Output stream still open after exit, keeping partial output"),
                    },
                }
            }
            completion
        }?;

        Ok(Finished {
            completion,
            container,
            output,
            stream_error,
        })
    }
}
