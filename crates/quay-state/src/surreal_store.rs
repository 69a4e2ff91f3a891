//! SurrealDB-backed JobStore and LogSink implementation
//!
//! Uses the rows in `schema` for persistence, converting to/from
//! `storage_traits` types at the boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::{ImageRow, JobRow, LogRow, VariantRow};
use crate::storage_traits::{
    check_job_transition, check_variant_transition, JobId, JobRecord, JobStatus, JobStore,
    LogEntry, LogSink, StorageResult, VariantId, VariantRecord, VariantStatus,
};

const NAMESPACE: &str = "quay";
const DATABASE: &str = "main";

/// SurrealDB-backed implementation of [`JobStore`] and [`LogSink`].
pub struct SurrealJobStore {
    db: Surreal<Any>,
}

impl SurrealJobStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `quay/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect("mem://").await
    }

    /// Create from environment variables.
    ///
    /// `SURREALDB_URL` selects a server or engine URL; without it the store
    /// persists locally under `.quay/db`.
    pub async fn from_env() -> crate::Result<Self> {
        if let Ok(url) = std::env::var("SURREALDB_URL") {
            return Self::connect(&url).await;
        }

        let path = ".quay/db";
        std::fs::create_dir_all(path).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                path, e
            ))
        })?;
        info!("No SURREALDB_URL found, using local persistence: {}", path);
        Self::connect(&format!("surrealkv://{}", path)).await
    }

    /// Connect to `url`, select the quay namespace and initialise the schema.
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!("SurrealJobStore connected ({})", url);
        Ok(Self { db })
    }

    /// Log lines recorded for a job, oldest first.
    pub async fn logs_for_job(&self, job_id: &JobId) -> StorageResult<Vec<LogEntry>> {
        let mut res = self
            .db
            .query("SELECT * FROM logs WHERE job_id = $jid ORDER BY timestamp ASC")
            .bind(("jid", job_id.0.clone()))
            .await?;
        let rows: Vec<LogRow> = res.take(0)?;
        Ok(rows
            .into_iter()
            .map(|r| LogEntry {
                project_id: r.project_id,
                job_id: JobId(r.job_id),
                variant_id: r.variant_id.map(VariantId),
                image: r.image,
                message: r.message,
                timestamp: r.timestamp,
            })
            .collect())
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_job(&self, job_id: &str) -> StorageResult<Option<JobRow>> {
        let mut res = self
            .db
            .query("SELECT * FROM jobs WHERE job_id = $jid")
            .bind(("jid", job_id.to_string()))
            .await?;
        let rows: Vec<JobRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_variant(&self, variant_id: &str) -> StorageResult<VariantRow> {
        let mut res = self
            .db
            .query("SELECT * FROM variants WHERE variant_id = $vid")
            .bind(("vid", variant_id.to_string()))
            .await?;
        let rows: Vec<VariantRow> = res.take(0)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::VariantNotFound {
                variant_id: variant_id.to_string(),
            })
    }

    async fn replace_variant(&self, row: VariantRow) -> StorageResult<()> {
        let vid = row.variant_id.clone();
        self.db
            .query("UPDATE variants CONTENT $row WHERE variant_id = $vid")
            .bind(("row", row))
            .bind(("vid", vid))
            .await?
            .check()?;
        Ok(())
    }

    fn job_from_row(row: JobRow) -> StorageResult<JobRecord> {
        Ok(JobRecord {
            job_id: JobId(row.job_id),
            project_id: row.project_id,
            status: parse_job_status(&row.status)?,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }

    fn variant_from_row(row: VariantRow) -> StorageResult<VariantRecord> {
        Ok(VariantRecord {
            variant_id: VariantId(row.variant_id),
            job_id: JobId(row.job_id),
            project_id: row.project_id,
            number: row.number,
            status: parse_variant_status(&row.status)?,
            metas: row.metas,
            image: row.image,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

fn parse_job_status(s: &str) -> StorageResult<JobStatus> {
    match s {
        "running" => Ok(JobStatus::Running),
        "success" => Ok(JobStatus::Success),
        "failed" => Ok(JobStatus::Failed),
        "errored" => Ok(JobStatus::Errored),
        other => Err(StorageError::Backend(format!("unknown job status: {other}"))),
    }
}

fn parse_variant_status(s: &str) -> StorageResult<VariantStatus> {
    match s {
        "pending" => Ok(VariantStatus::Pending),
        "running" => Ok(VariantStatus::Running),
        "success" => Ok(VariantStatus::Success),
        "failed" => Ok(VariantStatus::Failed),
        "errored" => Ok(VariantStatus::Errored),
        other => Err(StorageError::Backend(format!(
            "unknown variant status: {other}"
        ))),
    }
}

#[async_trait]
impl JobStore for SurrealJobStore {
    async fn create_job(&self, job: JobRecord) -> StorageResult<()> {
        if self.fetch_job(&job.job_id.0).await?.is_some() {
            return Err(StorageError::Duplicate { id: job.job_id.0 });
        }

        debug!(job_id = %job.job_id, "creating job");

        let row = JobRow {
            id: None,
            job_id: job.job_id.0,
            project_id: job.project_id,
            status: job.status.to_string(),
            started_at: job.started_at,
            completed_at: job.completed_at,
        };
        let _created: Option<JobRow> = self.db.create("jobs").content(row).await?;
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> StorageResult<JobRecord> {
        let row = self
            .fetch_job(&job_id.0)
            .await?
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: job_id.0.clone(),
            })?;
        Self::job_from_row(row)
    }

    async fn finish_job(
        &self,
        job_id: &JobId,
        status: JobStatus,
        completed_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut row = self
            .fetch_job(&job_id.0)
            .await?
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: job_id.0.clone(),
            })?;
        check_job_transition(job_id, parse_job_status(&row.status)?, status)?;

        row.status = status.to_string();
        row.completed_at = Some(completed_at);

        self.db
            .query("UPDATE jobs CONTENT $row WHERE job_id = $jid")
            .bind(("row", row))
            .bind(("jid", job_id.0.clone()))
            .await?
            .check()?;
        Ok(())
    }

    async fn create_variant(&self, variant: VariantRecord) -> StorageResult<()> {
        if self.fetch_job(&variant.job_id.0).await?.is_none() {
            return Err(StorageError::JobNotFound {
                job_id: variant.job_id.0,
            });
        }
        if self.fetch_variant(&variant.variant_id.0).await.is_ok() {
            return Err(StorageError::Duplicate {
                id: variant.variant_id.0,
            });
        }

        debug!(variant_id = %variant.variant_id, number = variant.number, "creating variant");

        let row = VariantRow {
            id: None,
            variant_id: variant.variant_id.0,
            job_id: variant.job_id.0,
            project_id: variant.project_id,
            number: variant.number,
            status: variant.status.to_string(),
            metas: variant.metas,
            image: variant.image,
            started_at: variant.started_at,
            completed_at: variant.completed_at,
        };
        let _created: Option<VariantRow> = self.db.create("variants").content(row).await?;
        Ok(())
    }

    async fn get_variant(&self, variant_id: &VariantId) -> StorageResult<VariantRecord> {
        let row = self.fetch_variant(&variant_id.0).await?;
        Self::variant_from_row(row)
    }

    async fn list_variants(&self, job_id: &JobId) -> StorageResult<Vec<VariantRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM variants WHERE job_id = $jid ORDER BY number ASC")
            .bind(("jid", job_id.0.clone()))
            .await?;
        let rows: Vec<VariantRow> = res.take(0)?;
        rows.into_iter().map(Self::variant_from_row).collect()
    }

    async fn update_variant_status(
        &self,
        variant_id: &VariantId,
        status: VariantStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StorageResult<()> {
        let mut row = self.fetch_variant(&variant_id.0).await?;
        check_variant_transition(variant_id, parse_variant_status(&row.status)?, status)?;

        row.status = status.to_string();
        if completed_at.is_some() {
            row.completed_at = completed_at;
        }
        self.replace_variant(row).await
    }

    async fn set_variant_image(&self, variant_id: &VariantId, image: &str) -> StorageResult<()> {
        let mut row = self.fetch_variant(&variant_id.0).await?;
        row.image = Some(image.to_string());
        self.replace_variant(row).await
    }

    async fn register_image(&self, role: &str, image: &str) -> StorageResult<()> {
        self.db
            .query("DELETE images WHERE role = $role")
            .bind(("role", role.to_string()))
            .await?
            .check()?;

        let row = ImageRow {
            id: None,
            role: role.to_string(),
            image: image.to_string(),
        };
        let _created: Option<ImageRow> = self.db.create("images").content(row).await?;
        Ok(())
    }

    async fn resolve_image(&self, role: &str) -> StorageResult<String> {
        let mut res = self
            .db
            .query("SELECT * FROM images WHERE role = $role")
            .bind(("role", role.to_string()))
            .await?;
        let rows: Vec<ImageRow> = res.take(0)?;
        rows.into_iter()
            .next()
            .map(|r| r.image)
            .ok_or_else(|| StorageError::ImageNotFound {
                role: role.to_string(),
            })
    }
}

#[async_trait]
impl LogSink for SurrealJobStore {
    async fn feed(&self, entry: LogEntry) -> StorageResult<()> {
        let row = LogRow {
            id: None,
            project_id: entry.project_id,
            job_id: entry.job_id.0,
            variant_id: entry.variant_id.map(|v| v.0),
            image: entry.image,
            message: entry.message,
            timestamp: entry.timestamp,
        };
        let _created: Option<LogRow> = self.db.create("logs").content(row).await?;
        Ok(())
    }
}
