//! Storage trait definitions for quay
//!
//! These traits define the persistence seams the orchestrator talks to:
//! - `JobStore`: job and variant records plus the image registry
//! - `LogSink`: write-only destination for container log lines
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random JobId
    pub fn new() -> Self {
        JobId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

/// Unique identifier for a variant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariantId(pub String);

impl VariantId {
    /// Generate a new random VariantId
    pub fn new() -> Self {
        VariantId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for VariantId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for VariantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Success,
    Failed,
    Errored,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Errored => write!(f, "errored"),
        }
    }
}

/// Status of a variant.
///
/// `Pending` is the state a variant is created in, before any container
/// has been started for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantStatus {
    Pending,
    Running,
    Success,
    Failed,
    Errored,
}

impl VariantStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            VariantStatus::Success | VariantStatus::Failed | VariantStatus::Errored
        )
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Pending may start running or be errored before it ever runs (a failed
    /// image build). Running may only move to a terminal state. Terminal
    /// states never change.
    pub fn can_transition_to(self, next: VariantStatus) -> bool {
        match (self, next) {
            (VariantStatus::Pending, VariantStatus::Running) => true,
            (VariantStatus::Pending, VariantStatus::Errored) => true,
            (VariantStatus::Running, n) => n.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for VariantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VariantStatus::Pending => write!(f, "pending"),
            VariantStatus::Running => write!(f, "running"),
            VariantStatus::Success => write!(f, "success"),
            VariantStatus::Failed => write!(f, "failed"),
            VariantStatus::Errored => write!(f, "errored"),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A job: one orchestrated CI run for a project at a source revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub project_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Create a job record in the `Running` state.
    pub fn new(job_id: JobId, project_id: impl Into<String>) -> Self {
        Self {
            job_id,
            project_id: project_id.into(),
            status: JobStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// A variant: one independently built and run configuration of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub variant_id: VariantId,
    pub job_id: JobId,
    pub project_id: String,
    /// Ordinal within the job (0-based, as emitted by the parser)
    pub number: u32,
    pub status: VariantStatus,
    /// Build metadata produced by the parser
    pub metas: BTreeMap<String, serde_json::Value>,
    /// Image reference, set once the variant's image has been built
    pub image: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl VariantRecord {
    /// Create a pending variant record with a fresh id.
    pub fn new(
        job_id: JobId,
        project_id: impl Into<String>,
        number: u32,
        metas: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            variant_id: VariantId::new(),
            job_id,
            project_id: project_id.into(),
            number,
            status: VariantStatus::Pending,
            metas,
            image: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// One line of container output, tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub project_id: String,
    pub job_id: JobId,
    /// `None` for job-level containers (fetch, parse)
    pub variant_id: Option<VariantId>,
    pub image: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

/// Job and variant persistence.
///
/// Guarantees:
/// - A job transitions Running -> Success | Failed | Errored (terminal).
/// - A variant transitions Pending -> Running -> terminal, or Pending ->
///   Errored; it never reverts.
/// - Illegal transitions are rejected with `StorageError::InvalidTransition`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job. Fails with `Duplicate` if the id is taken.
    async fn create_job(&self, job: JobRecord) -> StorageResult<()>;

    /// Retrieve a job by id.
    async fn get_job(&self, job_id: &JobId) -> StorageResult<JobRecord>;

    /// Move a running job to a terminal status.
    async fn finish_job(
        &self,
        job_id: &JobId,
        status: JobStatus,
        completed_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Persist a new variant. The owning job must exist.
    async fn create_variant(&self, variant: VariantRecord) -> StorageResult<()>;

    /// Retrieve a variant by id.
    async fn get_variant(&self, variant_id: &VariantId) -> StorageResult<VariantRecord>;

    /// All variants of a job, ordered by number.
    async fn list_variants(&self, job_id: &JobId) -> StorageResult<Vec<VariantRecord>>;

    /// Update a variant's status, stamping `completed_at` when given.
    async fn update_variant_status(
        &self,
        variant_id: &VariantId,
        status: VariantStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StorageResult<()>;

    /// Record the image built for a variant.
    async fn set_variant_image(&self, variant_id: &VariantId, image: &str) -> StorageResult<()>;

    /// Register the image used for a pipeline role (e.g. "parser", "scm-git").
    async fn register_image(&self, role: &str, image: &str) -> StorageResult<()>;

    /// Resolve the image for a role. `ImageNotFound` if none is registered.
    async fn resolve_image(&self, role: &str) -> StorageResult<String>;
}

// ---------------------------------------------------------------------------
// LogSink
// ---------------------------------------------------------------------------

/// Write-only destination for container log lines.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn feed(&self, entry: LogEntry) -> StorageResult<()>;
}

/// Validate a variant transition, producing the contract error on failure.
pub(crate) fn check_variant_transition(
    variant_id: &VariantId,
    from: VariantStatus,
    to: VariantStatus,
) -> StorageResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StorageError::InvalidTransition {
            id: variant_id.0.clone(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Validate that a job may be finished with `to`.
pub(crate) fn check_job_transition(
    job_id: &JobId,
    from: JobStatus,
    to: JobStatus,
) -> StorageResult<()> {
    if from == JobStatus::Running && to.is_terminal() {
        Ok(())
    } else {
        Err(StorageError::InvalidTransition {
            id: job_id.0.clone(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
