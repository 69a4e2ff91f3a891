//! Build stage: one image per parsed variant.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::docker::DockerCliRuntime;
use crate::error::StageError;
use crate::parser::VariantSpec;
use crate::runtime::RuntimeError;
use crate::stage::Stage;

/// Result of building a single variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Built { number: u32, image: String },
    /// The variant's own build failed; other variants are unaffected
    Failed { number: u32, reason: String },
}

impl BuildOutcome {
    pub fn number(&self) -> u32 {
        match self {
            BuildOutcome::Built { number, .. } | BuildOutcome::Failed { number, .. } => *number,
        }
    }
}

/// Builds variant images.
///
/// `Err` means the builder itself is unusable and the stage must stop;
/// a variant whose Dockerfile does not build is `Ok(BuildOutcome::Failed)`.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(
        &self,
        config: &PipelineConfig,
        variant: &VariantSpec,
    ) -> Result<BuildOutcome, StageError>;
}

/// Tag of the image built for variant `number`: `quay-<project>-<job>-<n>`.
pub fn image_tag(project_id: &str, job_id: &str, number: u32) -> String {
    let raw = format!("quay-{project_id}-{job_id}-{number}");
    raw.chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '.' | '_' | '-') => c,
            _ => '-',
        })
        .collect()
}

/// Builds each variant with `docker build`.
#[derive(Debug, Clone, Default)]
pub struct DockerImageBuilder {
    docker: DockerCliRuntime,
}

impl DockerImageBuilder {
    pub fn new(docker: DockerCliRuntime) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ImageBuilder for DockerImageBuilder {
    async fn build(
        &self,
        config: &PipelineConfig,
        variant: &VariantSpec,
    ) -> Result<BuildOutcome, StageError> {
        let tag = image_tag(&config.project_id, config.job_id.as_str(), variant.number);
        info!(variant = variant.number, image = %tag, "building variant image");

        match self.docker.build_image(&tag, &variant.context).await {
            Ok(()) => Ok(BuildOutcome::Built {
                number: variant.number,
                image: tag,
            }),
            Err(e @ RuntimeError::CommandFailed { .. }) => {
                warn!(variant = variant.number, error = %e, "variant image failed to build");
                Ok(BuildOutcome::Failed {
                    number: variant.number,
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(StageError::new(Stage::Build, e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostPaths, ScmSource};
    use quay_state::JobId;
    use std::collections::BTreeMap;
    use std::path::Path;

    #[test]
    fn tag_is_lowercase_and_sanitised() {
        assert_eq!(image_tag("Web App", "J1", 0), "quay-web-app-j1-0");
        assert_eq!(image_tag("p", "6f1c-2a", 12), "quay-p-6f1c-2a-12");
    }

    #[test]
    fn outcome_reports_number() {
        let failed = BuildOutcome::Failed {
            number: 4,
            reason: "x".into(),
        };
        assert_eq!(failed.number(), 4);
    }

    #[tokio::test]
    async fn missing_docker_binary_is_fatal() {
        let builder = DockerImageBuilder::new(DockerCliRuntime::new("/nonexistent/quay-docker"));
        let config = PipelineConfig::new(
            ScmSource {
                kind: "git".into(),
                url: "u".into(),
                reference: "r".into(),
            },
            "p",
            JobId::from("j"),
            HostPaths::under(Path::new("/tmp/quay"), "/var/run/docker.sock"),
        );
        let variant = VariantSpec {
            number: 0,
            metas: BTreeMap::new(),
            context: "/tmp/quay/work/0".into(),
        };

        let err = builder.build(&config, &variant).await.unwrap_err();
        assert_eq!(err.stage, Stage::Build);
    }
}
