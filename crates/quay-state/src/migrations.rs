//! SurrealDB schema initialization
//!
//! Defines every quay table with its indexes. Safe to run on every
//! connection: `DEFINE ... IF NOT EXISTS` is idempotent.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all quay tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing quay SurrealDB schema");

    init_jobs_table(db).await?;
    init_variants_table(db).await?;
    init_images_table(db).await?;
    init_logs_table(db).await?;

    info!("quay schema initialization complete");
    Ok(())
}

/// `jobs` table
///
/// ```text
/// TABLE jobs {
///   job_id:       STRING (unique)
///   project_id:   STRING (indexed)
///   status:       STRING (running | success | failed | errored)
///   started_at:   DATETIME
///   completed_at: DATETIME?
/// }
/// ```
async fn init_jobs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing jobs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS jobs SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_job_id ON TABLE jobs COLUMNS job_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_project_id ON TABLE jobs COLUMNS project_id;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// `variants` table
///
/// `(job_id, number)` is unique: the parser numbers variants densely per job.
async fn init_variants_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing variants table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS variants SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_variant_id ON TABLE variants COLUMNS variant_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_job_number ON TABLE variants COLUMNS job_id, number UNIQUE;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// `images` table: role -> image reference
async fn init_images_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing images table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS images SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_role ON TABLE images COLUMNS role UNIQUE;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// `logs` table: append-only container output
async fn init_logs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing logs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS logs SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_log_job ON TABLE logs COLUMNS job_id, variant_id;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}
