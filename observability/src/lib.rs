//! Logging setup for the container job harness.
//!
//! Library crates only emit `tracing` events. Binaries call
//! [`init_tracing`] once at startup to decide where those events go.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, LogFormat, TracingConfig, TracingError};

/// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, instrument, trace, warn, Level};
