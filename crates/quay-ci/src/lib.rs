//! quay-ci: the quay pipeline
//!
//! Drives a job through a fixed sequence of container stages:
//! - Fetch: check the source out with the `scm-<kind>` image
//! - Parse: run the `parser` image, which emits one folder per variant
//! - Build: build every variant's image
//! - Run: run all variants at once, each with its linked service containers
//!
//! Job and variant outcomes are recorded through `quay_state::JobStore`.

pub mod build;
pub mod config;
pub mod docker;
mod error;
pub mod fakes;
pub mod fetch;
pub mod logs;
pub mod parser;
pub mod pipeline;
pub mod runner;
pub mod runtime;
pub mod stage;
pub mod telemetry;

pub use build::{BuildOutcome, DockerImageBuilder, ImageBuilder};
pub use config::{HostPaths, PipelineConfig, ScmSource};
pub use docker::DockerCliRuntime;
pub use error::{PipelineError, RunError, StageError};
pub use fetch::{ContainerFetcher, SourceFetcher};
pub use logs::{TeeLogSink, TracingLogSink};
pub use parser::{ConfigParser, VariantSpec};
pub use pipeline::{
    aggregate_job_status, Collaborators, PipelineController, PipelineResult, PipelineState,
};
pub use runner::{ConcurrentRunner, ReadyVariant, RunReport, RunnerOptions, VariantOutcome};
pub use runtime::{
    ContainerHandle, ContainerRuntime, DeclaredFailurePolicy, ExitCodePolicy, ExitOutcome,
    RuntimeError,
};
pub use stage::Stage;
