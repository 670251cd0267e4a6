//! Running containers and job outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::spec::ContainerSpec;

/// A container created and started by one job run.
#[derive(Debug, Clone)]
pub struct RunningContainer {
    pub id: String,
    pub name: String,
    pub spec: ContainerSpec,
    pub started_at: DateTime<Utc>,
}

/// Which signal produced the reported exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitSource {
    /// The engine's wait call returned a terminal status.
    Wait,
    /// The container was removed first; the code came from its exit event.
    RemovalEvent,
    /// The container was gone before any exit code could be observed.
    AssumedAfterRemoval,
}

/// Outcome of a job that reached a terminal state.
///
/// A non-zero `exit_code` is data, not an error. Use [`JobResult::check`]
/// when a non-zero exit should fail the caller.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub container_id: String,
    pub container_name: String,
    pub exit_code: i64,
    pub exit_source: ExitSource,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Non-fatal problem found after the job finished, e.g. truncated output.
    pub container_error: Option<JobError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Fail with [`JobError::NonZeroExit`] unless the job exited 0.
    pub fn check(&self) -> Result<&Self, JobError> {
        if self.success() {
            Ok(self)
        } else {
            Err(JobError::NonZeroExit {
                code: self.exit_code,
                stderr: self.stderr_lossy().trim().to_string(),
            })
        }
    }
}
