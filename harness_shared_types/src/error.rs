//! Error taxonomy for engine calls and job runs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure reported by a container engine call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("No such object: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Engine API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Engine transport error: {0}")]
    Transport(String),

    #[error("Stream error: {0}")]
    Stream(String),
}

impl EngineError {
    /// Whether the engine reported that the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

/// Stage of a job run, used to report where cancellation hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    PullingImage,
    Creating,
    Starting,
    Running,
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            JobStage::PullingImage => "pulling image",
            JobStage::Creating => "creating container",
            JobStage::Starting => "starting container",
            JobStage::Running => "running",
        };
        f.write_str(stage)
    }
}

/// Errors returned by a job run and its wrappers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("Failed to pull image {image}: {source}")]
    Pull {
        image: String,
        #[source]
        source: EngineError,
    },

    #[error("Invalid container spec: {0}")]
    InvalidSpec(String),

    #[error("Failed to create container {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: EngineError,
    },

    #[error("Failed to attach to container {id}: {source}")]
    Attach {
        id: String,
        #[source]
        source: EngineError,
    },

    /// The engine removed the container before start could observe it.
    #[error("Container {id} was removed before it could be started")]
    StartRace { id: String },

    #[error("Failed to start container {id}: {source}")]
    Start {
        id: String,
        #[source]
        source: EngineError,
    },

    #[error("Waiting for container {id} failed: {message}")]
    Wait { id: String, message: String },

    #[error("Job canceled while {stage}")]
    Canceled { stage: JobStage },

    #[error("Container output exceeded {limit} bytes and was truncated")]
    OutputTruncated { limit: usize },

    #[error("Container output stream failed: {0}")]
    Output(String),

    #[error("Job exited with code {code}: {stderr}")]
    NonZeroExit { code: i64, stderr: String },
}

impl JobError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, JobError::Canceled { .. })
    }
}

/// A container removal that failed during cleanup. Logged, never returned
/// as a job failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Failed to remove container {container_id}: {source}")]
pub struct CleanupWarning {
    pub container_id: String,
    #[source]
    pub source: EngineError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        assert!(EngineError::NotFound("abc".into()).is_not_found());
        assert!(!EngineError::Conflict("abc".into()).is_not_found());
        assert!(!EngineError::Api { status: 404, message: "x".into() }.is_not_found());
    }

    #[test]
    fn test_canceled_message_names_stage() {
        let err = JobError::Canceled { stage: JobStage::Running };
        assert!(err.is_canceled());
        assert_eq!(err.to_string(), "Job canceled while running");
    }

    #[test]
    fn test_cleanup_warning_display() {
        let warning = CleanupWarning {
            container_id: "c1".to_string(),
            source: EngineError::Api { status: 500, message: "boom".to_string() },
        };
        assert_eq!(
            warning.to_string(),
            "Failed to remove container c1: Engine API error (status 500): boom"
        );
    }
}
