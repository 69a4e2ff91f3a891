//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryJobStore` and `MemoryLogSink` that satisfy the trait
//! contracts without any external dependencies.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryJobStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StoreState {
    jobs: HashMap<String, JobRecord>,
    variants: HashMap<String, VariantRecord>,
    images: HashMap<String, String>,
}

/// In-memory job store backed by `HashMap`s behind a single mutex.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<StoreState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: JobRecord) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.jobs.contains_key(&job.job_id.0) {
            return Err(StorageError::Duplicate {
                id: job.job_id.0.clone(),
            });
        }
        state.jobs.insert(job.job_id.0.clone(), job);
        Ok(())
    }

    async fn get_job(&self, job_id: &JobId) -> StorageResult<JobRecord> {
        let state = self.state.lock().unwrap();
        state
            .jobs
            .get(&job_id.0)
            .cloned()
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: job_id.0.clone(),
            })
    }

    async fn finish_job(
        &self,
        job_id: &JobId,
        status: JobStatus,
        completed_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .get_mut(&job_id.0)
            .ok_or_else(|| StorageError::JobNotFound {
                job_id: job_id.0.clone(),
            })?;
        check_job_transition(job_id, job.status, status)?;
        job.status = status;
        job.completed_at = Some(completed_at);
        Ok(())
    }

    async fn create_variant(&self, variant: VariantRecord) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.jobs.contains_key(&variant.job_id.0) {
            return Err(StorageError::JobNotFound {
                job_id: variant.job_id.0.clone(),
            });
        }
        if state.variants.contains_key(&variant.variant_id.0) {
            return Err(StorageError::Duplicate {
                id: variant.variant_id.0.clone(),
            });
        }
        state.variants.insert(variant.variant_id.0.clone(), variant);
        Ok(())
    }

    async fn get_variant(&self, variant_id: &VariantId) -> StorageResult<VariantRecord> {
        let state = self.state.lock().unwrap();
        state
            .variants
            .get(&variant_id.0)
            .cloned()
            .ok_or_else(|| StorageError::VariantNotFound {
                variant_id: variant_id.0.clone(),
            })
    }

    async fn list_variants(&self, job_id: &JobId) -> StorageResult<Vec<VariantRecord>> {
        let state = self.state.lock().unwrap();
        let mut variants: Vec<VariantRecord> = state
            .variants
            .values()
            .filter(|v| v.job_id == *job_id)
            .cloned()
            .collect();
        variants.sort_by_key(|v| v.number);
        Ok(variants)
    }

    async fn update_variant_status(
        &self,
        variant_id: &VariantId,
        status: VariantStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        let variant =
            state
                .variants
                .get_mut(&variant_id.0)
                .ok_or_else(|| StorageError::VariantNotFound {
                    variant_id: variant_id.0.clone(),
                })?;
        check_variant_transition(variant_id, variant.status, status)?;
        variant.status = status;
        if completed_at.is_some() {
            variant.completed_at = completed_at;
        }
        Ok(())
    }

    async fn set_variant_image(&self, variant_id: &VariantId, image: &str) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        let variant =
            state
                .variants
                .get_mut(&variant_id.0)
                .ok_or_else(|| StorageError::VariantNotFound {
                    variant_id: variant_id.0.clone(),
                })?;
        variant.image = Some(image.to_string());
        Ok(())
    }

    async fn register_image(&self, role: &str, image: &str) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        state.images.insert(role.to_string(), image.to_string());
        Ok(())
    }

    async fn resolve_image(&self, role: &str) -> StorageResult<String> {
        let state = self.state.lock().unwrap();
        state
            .images
            .get(role)
            .cloned()
            .ok_or_else(|| StorageError::ImageNotFound {
                role: role.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// MemoryLogSink
// ---------------------------------------------------------------------------

/// In-memory log sink that keeps every entry in arrival order.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything fed so far.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Messages fed for a given image, in arrival order.
    pub fn messages_for(&self, image: &str) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.image == image)
            .map(|e| e.message.clone())
            .collect()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn feed(&self, entry: LogEntry) -> StorageResult<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}
