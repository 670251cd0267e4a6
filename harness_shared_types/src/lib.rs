//! Types shared by the job engine, its engine backends, and the CLI.

pub mod error;
pub mod image;
pub mod job;
pub mod spec;

pub use error::{CleanupWarning, EngineError, JobError, JobStage};
pub use image::ImageRef;
pub use job::{ExitSource, JobResult, RunningContainer};
pub use spec::{Bind, ContainerSpec, CLEANUP_LABEL, ROOT_USER, RUN_ID_LABEL};
