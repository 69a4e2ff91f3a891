//! Error types for quay-state

use thiserror::Error;

/// Errors raised while connecting to or initialising the database.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the `JobStore` and `LogSink` contracts.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("variant not found: {variant_id}")]
    VariantNotFound { variant_id: String },

    #[error("duplicate record: {id}")]
    Duplicate { id: String },

    #[error("no image registered for role '{role}'")]
    ImageNotFound { role: String },

    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}
