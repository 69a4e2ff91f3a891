//! Parse stage: turn the checked-out build configuration into variants.
//!
//! The parser image reads the source and writes one numbered folder per
//! variant into the work folder:
//!
//! ```text
//! work/
//!   0/Dockerfile
//!   0/meta.json      optional JSON object of build metadata
//!   0/services       optional service manifest, read by the runner
//!   1/Dockerfile
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use quay_state::{JobStore, LogSink};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::config::{self, PipelineConfig};
use crate::error::StageError;
use crate::logs::LogSource;
use crate::runtime::{ContainerRuntime, RunOptions};
use crate::stage::{remove_stage_container, run_stage_container, Stage};

/// Image role of the configuration parser.
pub const PARSER_ROLE: &str = "parser";

const DOCKERFILE: &str = "Dockerfile";
const META_FILE: &str = "meta.json";

/// One variant emitted by the parser.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantSpec {
    pub number: u32,
    pub metas: BTreeMap<String, Value>,
    /// Build context holding the variant's Dockerfile
    pub context: PathBuf,
}

/// Runs the parser container and reads back what it produced.
pub struct ConfigParser {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn JobStore>,
    logs: Arc<dyn LogSink>,
}

impl ConfigParser {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn JobStore>,
        logs: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            runtime,
            store,
            logs,
        }
    }

    /// Run the parser over the checked-out source.
    ///
    /// Either every variant is returned or the stage fails as a whole. On a
    /// non-zero exit the parser container is left in place.
    #[instrument(skip_all, fields(job_id = %config.job_id))]
    pub async fn parse(&self, config: &PipelineConfig) -> Result<Vec<VariantSpec>, StageError> {
        let image = self
            .store
            .resolve_image(PARSER_ROLE)
            .await
            .map_err(|e| StageError::new(Stage::Parse, e.to_string()))?;

        let options = parser_run_options(config, image.clone());
        let source = LogSource {
            project_id: config.project_id.clone(),
            job_id: config.job_id.clone(),
            variant_id: None,
            image,
        };
        let (handle, code) = run_stage_container(
            self.runtime.as_ref(),
            self.logs.clone(),
            Stage::Parse,
            &options,
            source,
        )
        .await?;

        if code != 0 {
            warn!(container = %handle.id, code, "parser failed, container kept for inspection");
            return Err(
                StageError::new(Stage::Parse, format!("parser exited with code {code}"))
                    .with_container(handle.id),
            );
        }
        remove_stage_container(self.runtime.as_ref(), handle, Stage::Parse).await?;

        let variants = read_variants(&config.paths.work).await?;
        info!(count = variants.len(), "build configuration parsed");
        Ok(variants)
    }
}

fn parser_run_options(config: &PipelineConfig, image: String) -> RunOptions {
    let paths = &config.paths;
    let mut volume_binds = vec![
        config::bind(&paths.source, config::SOURCE_MOUNT),
        config::bind(&paths.meta, config::META_MOUNT),
        config::bind(&paths.work, config::OUTPUT_MOUNT),
        config::bind(&paths.docker_sock, config::DOCKER_SOCK_MOUNT),
    ];
    if let Some(key) = &paths.crypto_key_file {
        volume_binds.push(config::bind(key, config::CRYPTO_KEY_MOUNT));
    }
    RunOptions {
        name: None,
        image,
        env: config.env().clone(),
        volume_binds,
        links: Vec::new(),
    }
}

/// Read the variants the parser wrote into `output`, ordered by number.
///
/// Entries whose name is not a number are ignored.
pub async fn read_variants(output: &Path) -> Result<Vec<VariantSpec>, StageError> {
    let unreadable =
        |e: std::io::Error| StageError::new(Stage::Parse, format!("{}: {e}", output.display()));

    let mut entries = tokio::fs::read_dir(output).await.map_err(unreadable)?;
    let mut variants = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(unreadable)? {
        let Some(number) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if !entry.file_type().await.map_err(unreadable)?.is_dir() {
            continue;
        }
        variants.push(read_variant(number, entry.path()).await?);
    }

    if variants.is_empty() {
        return Err(StageError::new(
            Stage::Parse,
            format!("parser produced no variants in {}", output.display()),
        ));
    }
    variants.sort_by_key(|v| v.number);
    Ok(variants)
}

async fn read_variant(number: u32, context: PathBuf) -> Result<VariantSpec, StageError> {
    let dockerfile = context.join(DOCKERFILE);
    if !tokio::fs::try_exists(&dockerfile).await.unwrap_or(false) {
        return Err(StageError::new(
            Stage::Parse,
            format!("variant {number} has no {DOCKERFILE}"),
        ));
    }

    let meta_path = context.join(META_FILE);
    let metas = match tokio::fs::read(&meta_path).await {
        Ok(bytes) => serde_json::from_slice::<BTreeMap<String, Value>>(&bytes).map_err(|e| {
            StageError::new(Stage::Parse, format!("variant {number}: bad {META_FILE}: {e}"))
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
        Err(e) => {
            return Err(StageError::new(
                Stage::Parse,
                format!("variant {number}: {}: {e}", meta_path.display()),
            ))
        }
    };

    Ok(VariantSpec {
        number,
        metas,
        context,
    })
}
