//! Row definitions for the quay SurrealDB tables
//!
//! Tables:
//! - jobs: one row per job
//! - variants: one row per variant, keyed by variant_id
//! - images: role -> image registry
//! - logs: container output lines

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Job row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    pub job_id: String,
    pub project_id: String,
    /// "running" | "success" | "failed" | "errored"
    pub status: String,
    #[serde(with = "surreal_datetime")]
    pub started_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Variant row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantRow {
    /// SurrealDB record ID
    pub id: Option<surrealdb::sql::Thing>,
    pub variant_id: String,
    pub job_id: String,
    pub project_id: String,
    pub number: u32,
    /// "pending" | "running" | "success" | "failed" | "errored"
    pub status: String,
    #[serde(default)]
    pub metas: BTreeMap<String, serde_json::Value>,
    pub image: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub started_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Image registry row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub role: String,
    pub image: String,
}

/// Container log row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRow {
    pub id: Option<surrealdb::sql::Thing>,
    pub project_id: String,
    pub job_id: String,
    pub variant_id: Option<String>,
    pub image: String,
    pub message: String,
    #[serde(with = "surreal_datetime")]
    pub timestamp: DateTime<Utc>,
}
