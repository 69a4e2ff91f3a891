//! Fetch stage: check the source out into the shared source folder.

use std::sync::Arc;

use async_trait::async_trait;
use quay_state::{JobStore, LogSink};
use tracing::{info, instrument};

use crate::config::{self, PipelineConfig};
use crate::error::StageError;
use crate::logs::LogSource;
use crate::runtime::{ContainerRuntime, RunOptions};
use crate::stage::{remove_stage_container, run_stage_container, Stage};

/// Checks out the revision a job builds.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, config: &PipelineConfig) -> Result<(), StageError>;
}

/// Image role of the fetcher for an SCM kind, e.g. `scm-git`.
pub fn fetcher_role(scm_kind: &str) -> String {
    format!("scm-{scm_kind}")
}

/// Runs the registered `scm-<kind>` image as a one-shot container.
///
/// A failing container is kept so its state can be inspected.
pub struct ContainerFetcher {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn JobStore>,
    logs: Arc<dyn LogSink>,
}

impl ContainerFetcher {
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

    fn run_options(config: &PipelineConfig, image: String) -> RunOptions {
        let paths = &config.paths;
        let mut volume_binds = vec![
            config::bind(&paths.source, config::SOURCE_MOUNT),
            config::bind(&paths.meta, config::META_MOUNT),
        ];
        if let Some(key) = &paths.key_file {
            volume_binds.push(config::bind(key, config::KEY_MOUNT));
        }
        RunOptions {
            name: None,
            image,
            env: config.env().clone(),
            volume_binds,
            links: Vec::new(),
        }
    }
}

#[async_trait]
impl SourceFetcher for ContainerFetcher {
    #[instrument(skip_all, fields(job_id = %config.job_id, scm = %config.scm.kind))]
    async fn fetch(&self, config: &PipelineConfig) -> Result<(), StageError> {
        let role = fetcher_role(&config.scm.kind);
        let image = self
            .store
            .resolve_image(&role)
            .await
            .map_err(|e| StageError::new(Stage::Fetch, e.to_string()))?;

        let options = Self::run_options(config, image.clone());
        let source = LogSource {
            project_id: config.project_id.clone(),
            job_id: config.job_id.clone(),
            variant_id: None,
            image,
        };
        let (handle, code) = run_stage_container(
            self.runtime.as_ref(),
            self.logs.clone(),
            Stage::Fetch,
            &options,
            source,
        )
        .await?;

        if code != 0 {
            return Err(
                StageError::new(Stage::Fetch, format!("fetcher exited with code {code}"))
                    .with_container(handle.id),
            );
        }

        info!(url = %config.scm.url, reference = %config.scm.reference, "source fetched");
        remove_stage_container(self.runtime.as_ref(), handle, Stage::Fetch).await
    }
}
