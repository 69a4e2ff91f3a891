//! Error types for quay-ci

use std::path::PathBuf;
use std::time::Duration;

use quay_state::{StorageError, VariantStatus};
use thiserror::Error;

use crate::runtime::RuntimeError;
use crate::stage::Stage;

/// A fetch, parse or build failure. Always fatal to the pipeline.
#[derive(Error, Debug)]
#[error("{stage} stage failed{}: {reason}", container_suffix(.container_id))]
pub struct StageError {
    pub stage: Stage,
    /// Container left behind for inspection, if any
    pub container_id: Option<String>,
    pub reason: String,
}

impl StageError {
    pub fn new(stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            container_id: None,
            reason: reason.into(),
        }
    }

    pub fn with_container(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }
}

fn container_suffix(container_id: &Option<String>) -> String {
    container_id
        .as_deref()
        .map(|id| format!(" (container {id})"))
        .unwrap_or_default()
}

/// Fatal errors of the run stage. Any of these aborts the whole batch.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("variant {number}: container runtime error: {source}")]
    Runtime {
        number: u32,
        #[source]
        source: RuntimeError,
    },

    #[error(
        "variant {number}: run failed with exit code {code}, check the logs of container {container_id}"
    )]
    DeclaredFailure {
        number: u32,
        container_id: String,
        code: i64,
    },

    #[error("variant {number}: failed to remove container {container_id}: {source}")]
    Remove {
        number: u32,
        container_id: String,
        #[source]
        source: RuntimeError,
    },

    #[error("variant {number}: container {container_id} still running after {timeout:?}")]
    WaitTimeout {
        number: u32,
        container_id: String,
        timeout: Duration,
    },

    #[error("variant {number}: cannot read service manifest {}: {source}", .path.display())]
    Manifest {
        number: u32,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("variant {number}: store update failed: {source}")]
    Store {
        number: u32,
        #[source]
        source: StorageError,
    },

    /// The variant stopped because another variant failed first.
    #[error("variant {number}: cancelled")]
    Cancelled { number: u32 },

    #[error("variant task ended without reporting: {0}")]
    TaskLost(String),
}

impl RunError {
    /// Variant the error originated from, when known.
    pub fn variant_number(&self) -> Option<u32> {
        match self {
            RunError::Runtime { number, .. }
            | RunError::DeclaredFailure { number, .. }
            | RunError::Remove { number, .. }
            | RunError::WaitTimeout { number, .. }
            | RunError::Manifest { number, .. }
            | RunError::Store { number, .. }
            | RunError::Cancelled { number } => Some(*number),
            RunError::TaskLost(_) => None,
        }
    }
}

/// Errors that stop a pipeline. The job is recorded as errored first.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("run stage failed: {0}")]
    Run(#[from] RunError),

    #[error("store error: {0}")]
    Store(#[from] StorageError),

    #[error("variant {number} reached the end of the pipeline as {status}")]
    UnsettledVariant { number: u32, status: VariantStatus },

    #[error("{original}; recording the job as errored also failed: {source}")]
    Persistence {
        original: Box<PipelineError>,
        #[source]
        source: StorageError,
    },
}

impl PipelineError {
    /// Stage the failure belongs to, when it belongs to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Stage(e) => Some(e.stage),
            PipelineError::Run(_) => Some(Stage::Run),
            PipelineError::Persistence { original, .. } => original.stage(),
            PipelineError::Store(_) | PipelineError::UnsettledVariant { .. } => None,
        }
    }
}
