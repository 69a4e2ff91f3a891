//! Immutable pipeline configuration.
//!
//! Built once by the entry point and shared by every stage; nothing in the
//! pipeline mutates it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use quay_state::JobId;
use serde::{Deserialize, Serialize};

/// Environment variables propagated into every launched container.
pub const ENV_SCM: &str = "QUAY_SCM";
pub const ENV_SCM_URL: &str = "QUAY_SCM_URL";
pub const ENV_SCM_REFERENCE: &str = "QUAY_SCM_REFERENCE";
pub const ENV_PROJECT_ID: &str = "QUAY_PROJECT_ID";
pub const ENV_JOB_ID: &str = "QUAY_JOB_ID";

/// Mount points inside stage containers.
pub const SOURCE_MOUNT: &str = "/quay/source";
pub const META_MOUNT: &str = "/meta";
pub const OUTPUT_MOUNT: &str = "/quay-output";
pub const KEY_MOUNT: &str = "/quay-key";
pub const CRYPTO_KEY_MOUNT: &str = "/quay-crypto-key";
pub const DOCKER_SOCK_MOUNT: &str = "/docker.sock";
pub const ARTIFACTS_MOUNT: &str = "/artifacts";

/// Name of the per-variant service manifest inside the variant's work folder.
pub const SERVICES_MANIFEST: &str = "services";

/// Source-control coordinates of the revision being built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScmSource {
    /// SCM kind, e.g. "git"
    pub kind: String,
    pub url: String,
    pub reference: String,
}

/// Host folders shared with stage containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPaths {
    /// Checked-out source
    pub source: PathBuf,
    /// Parser output: one sub-folder per variant
    pub work: PathBuf,
    /// Metadata written by the fetch stage
    pub meta: PathBuf,
    /// Per-variant artifacts
    pub artifacts: PathBuf,
    /// Deploy key used by the fetch container
    pub key_file: Option<PathBuf>,
    /// Key used by the parser to decrypt secured variables
    pub crypto_key_file: Option<PathBuf>,
    /// Docker socket exposed to the parser
    pub docker_sock: PathBuf,
}

impl HostPaths {
    /// Standard layout under a single base folder.
    pub fn under(base: &Path, docker_sock: impl Into<PathBuf>) -> Self {
        Self {
            source: base.join("source"),
            work: base.join("work"),
            meta: base.join("meta"),
            artifacts: base.join("artifacts"),
            key_file: None,
            crypto_key_file: None,
            docker_sock: docker_sock.into(),
        }
    }
}

/// Everything a pipeline run needs to know, fixed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub scm: ScmSource,
    pub project_id: String,
    pub job_id: JobId,
    pub paths: HostPaths,
    env: BTreeMap<String, String>,
}

impl PipelineConfig {
    pub fn new(
        scm: ScmSource,
        project_id: impl Into<String>,
        job_id: JobId,
        paths: HostPaths,
    ) -> Self {
        let project_id = project_id.into();
        let env = BTreeMap::from([
            (ENV_SCM.to_string(), scm.kind.clone()),
            (ENV_SCM_URL.to_string(), scm.url.clone()),
            (ENV_SCM_REFERENCE.to_string(), scm.reference.clone()),
            (ENV_PROJECT_ID.to_string(), project_id.clone()),
            (ENV_JOB_ID.to_string(), job_id.0.clone()),
        ]);
        Self {
            scm,
            project_id,
            job_id,
            paths,
            env,
        }
    }

    /// Environment handed to every container the pipeline launches.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Work folder of variant `number`, where the parser left its Dockerfile.
    pub fn variant_work_dir(&self, number: u32) -> PathBuf {
        self.paths.work.join(number.to_string())
    }

    /// Service manifest of variant `number`.
    pub fn services_manifest(&self, number: u32) -> PathBuf {
        self.variant_work_dir(number).join(SERVICES_MANIFEST)
    }

    /// Artifacts folder of variant `number`.
    pub fn variant_artifacts_dir(&self, number: u32) -> PathBuf {
        self.paths.artifacts.join(number.to_string())
    }
}

/// `host:container` volume bind.
pub(crate) fn bind(host: &Path, container: &str) -> String {
    format!("{}:{}", host.display(), container)
}
