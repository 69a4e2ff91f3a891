//! Container runtime boundary.
//!
//! The pipeline never talks to Docker directly: it goes through
//! [`ContainerRuntime`], and raw exit codes are classified into an
//! [`ExitOutcome`] as soon as they cross this boundary.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by a container runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("failed to invoke {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container name already in use: {0}")]
    NameConflict(String),

    #[error("unexpected runtime output: {0}")]
    InvalidOutput(String),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Lines of container output; ends when the container exits.
pub type LogStream = BoxStream<'static, String>;

/// What to launch. Containers are always started detached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Fixed container name; the runtime picks one when absent
    pub name: Option<String>,
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// `host:container` binds
    pub volume_binds: Vec<String>,
    /// `container:alias` links
    pub links: Vec<String>,
}

impl RunOptions {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }
}

/// How a container is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveOptions {
    /// Kill the container if it is still running
    pub force: bool,
    /// Reclaim anonymous volumes
    pub remove_volumes: bool,
}

impl RemoveOptions {
    /// Force removal and reclaim volumes.
    pub fn purge() -> Self {
        Self {
            force: true,
            remove_volumes: true,
        }
    }
}

/// A running container.
///
/// Deliberately not `Clone`: the task that started a container owns its
/// handle until [`ContainerRuntime::remove`] consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: Option<String>,
    pub image: String,
}

impl ContainerHandle {
    /// Id shortened the way `docker ps` prints it.
    pub fn short_id(&self) -> &str {
        &self.id[..12.min(self.id.len())]
    }
}

/// Starts, observes and removes containers.
///
/// Implementations must tolerate concurrent calls from many tasks.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a detached container.
    async fn run(&self, options: &RunOptions) -> RuntimeResult<ContainerHandle>;

    /// Follow the container's output until it exits.
    async fn stream_logs(&self, handle: &ContainerHandle) -> RuntimeResult<LogStream>;

    /// Block until the container exits and return its exit code.
    async fn wait(&self, handle: &ContainerHandle) -> RuntimeResult<i64>;

    /// Remove the container. Removing an unknown container is an error.
    async fn remove(&self, handle: ContainerHandle, options: RemoveOptions) -> RuntimeResult<()>;
}

// ---------------------------------------------------------------------------
// Exit-code protocol
// ---------------------------------------------------------------------------

/// Exit code a run container uses to signal that its harness aborted.
pub const DEFAULT_DECLARED_FAILURE_CODE: i64 = 42;

/// What a declared failure does to the rest of the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeclaredFailurePolicy {
    /// Abort the whole run batch and error the job.
    #[default]
    AbortBatch,
    /// Treat it like any other non-zero exit: the variant fails, the batch goes on.
    FailVariant,
}

/// How run-container exit codes are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitCodePolicy {
    pub declared_failure_code: i64,
    pub on_declared_failure: DeclaredFailurePolicy,
}

impl Default for ExitCodePolicy {
    fn default() -> Self {
        Self {
            declared_failure_code: DEFAULT_DECLARED_FAILURE_CODE,
            on_declared_failure: DeclaredFailurePolicy::AbortBatch,
        }
    }
}

/// Classified exit of a run container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitOutcome {
    Succeeded,
    /// Ordinary non-zero exit, local to the variant
    Failed { code: i64 },
    /// The reserved code, escalated to the whole batch
    DeclaredFailure { code: i64 },
}

impl ExitOutcome {
    pub fn classify(code: i64, policy: &ExitCodePolicy) -> Self {
        if code == 0 {
            ExitOutcome::Succeeded
        } else if code == policy.declared_failure_code
            && policy.on_declared_failure == DeclaredFailurePolicy::AbortBatch
        {
            ExitOutcome::DeclaredFailure { code }
        } else {
            ExitOutcome::Failed { code }
        }
    }
}
