//! Ephemeral container job engine.
//!
//! This crate runs one-shot jobs in containers and guarantees the container
//! is gone afterwards, whichever way the job ends:
//! - `JobRunner`: pull, create, start, capture output, wait, clean up
//! - `DockerEngine`: bollard-backed engine (requires `docker` feature)
//! - `MockEngine`: in-memory engine for testing (default)
//!
//! The `volume` and `files` modules build small helper jobs on top of the
//! runner, and `scope`/`sweep` remove whatever a test run left behind.

pub mod cleanup;
pub mod config;
pub mod files;
pub mod image;
pub mod naming;
pub mod output;
pub mod runner;
pub mod scope;
pub mod spec;
pub mod sweep;
pub mod volume;
pub mod wait;

#[cfg(feature = "mock-engine")]
pub mod mock;

#[cfg(feature = "docker")]
pub mod docker;

// Re-export common types
pub use container_engine_interface::{ContainerEngine, LabelFilter, WaitCondition};
pub use harness_shared_types::{
    Bind, CleanupWarning, ContainerSpec, EngineError, ExitSource, ImageRef, JobError, JobResult,
    JobStage, CLEANUP_LABEL, ROOT_USER, RUN_ID_LABEL,
};

pub use cleanup::{CleanupOutcome, CleanupSupervisor};
pub use config::{DockerConfig, JobEngineConfig, PullPolicy};
pub use files::FileRetriever;
pub use image::ImageCache;
pub use runner::JobRunner;
pub use scope::RunScope;
pub use spec::ContainerOptions;
pub use sweep::{LabelSweeper, SweepReport};
pub use volume::VolumeOwner;
pub use wait::{Completion, CompletionWaiter};

#[cfg(feature = "mock-engine")]
pub use mock::{JobScript, MockEngine};

#[cfg(feature = "docker")]
pub use docker::DockerEngine;
