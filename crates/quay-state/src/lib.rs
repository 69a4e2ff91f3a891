//! quay-state: persistence for the quay orchestrator
//!
//! Owns the job and variant records the pipeline mutates, the image
//! registry used to resolve stage images, and the log sink container
//! output is fed into.
//!
//! ## Key Components
//!
//! - `JobStore` / `LogSink`: the storage contracts
//! - `SurrealJobStore`: SurrealDB implementation of both
//! - `fakes`: in-memory implementations for tests

mod error;
pub mod fakes;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use storage_traits::{
    JobId, JobRecord, JobStatus, JobStore, LogEntry, LogSink, StorageResult, VariantId,
    VariantRecord, VariantStatus,
};
pub use surreal_store::SurrealJobStore;

/// Result type for connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
