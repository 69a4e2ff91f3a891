//! quayd - run one quay CI job
//!
//! Every setting can come from a flag or from its `QUAY_*` environment
//! variable, so the orchestrator can be started as a container itself.
//! The process exits non-zero only when the pipeline could not finish;
//! a job whose variants failed still exits cleanly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use quay_ci::runtime::DEFAULT_DECLARED_FAILURE_CODE;
use quay_ci::telemetry;
use quay_ci::{
    Collaborators, ContainerFetcher, ContainerRuntime, DeclaredFailurePolicy, DockerCliRuntime,
    DockerImageBuilder, ExitCodePolicy, HostPaths, PipelineConfig, PipelineController,
    RunnerOptions, ScmSource, TeeLogSink, TracingLogSink,
};
use quay_state::{JobId, JobRecord, JobStore, LogSink, StorageError, SurrealJobStore};
use tracing::{error, info, Level};

#[derive(Parser, Debug)]
#[command(name = "quayd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Fetch, parse, build and run one CI job", long_about = None)]
struct Cli {
    /// SCM kind; selects the `scm-<kind>` fetcher image
    #[arg(long, env = "QUAY_SCM", default_value = "git")]
    scm: String,

    /// Repository URL
    #[arg(long, env = "QUAY_SCM_URL")]
    scm_url: String,

    /// Branch, tag or commit to build
    #[arg(long, env = "QUAY_SCM_REFERENCE", default_value = "master")]
    scm_reference: String,

    #[arg(long, env = "QUAY_PROJECT_ID")]
    project_id: String,

    #[arg(long, env = "QUAY_JOB_ID")]
    job_id: String,

    /// Host folder holding the job's source, work, meta and artifacts folders
    #[arg(long, env = "QUAY_HOST_BASE")]
    host_base: PathBuf,

    /// Deploy key mounted into the fetcher
    #[arg(long, env = "QUAY_KEY_FILE")]
    key_file: Option<PathBuf>,

    /// Key the parser uses to decrypt secured variables
    #[arg(long, env = "QUAY_CRYPTO_KEY_FILE")]
    crypto_key_file: Option<PathBuf>,

    /// Docker socket exposed to the parser
    #[arg(long, env = "QUAY_DOCKER_SOCK", default_value = "/var/run/docker.sock")]
    docker_sock: PathBuf,

    #[arg(long, env = "QUAY_DOCKER_BIN", default_value = "docker")]
    docker_bin: String,

    /// Daemon address passed to `docker -H`
    #[arg(long, env = "QUAY_DOCKER_HOST")]
    docker_host: Option<String>,

    /// Exit code with which a run container declares its harness aborted
    #[arg(
        long,
        env = "QUAY_DECLARED_FAILURE_CODE",
        default_value_t = DEFAULT_DECLARED_FAILURE_CODE
    )]
    declared_failure_code: i64,

    #[arg(
        long,
        env = "QUAY_DECLARED_FAILURE_POLICY",
        value_enum,
        default_value_t = FailurePolicyArg::AbortBatch
    )]
    declared_failure_policy: FailurePolicyArg,

    /// Kill run containers still running after this many seconds
    #[arg(long, env = "QUAY_WAIT_TIMEOUT_SECS")]
    wait_timeout_secs: Option<u64>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum FailurePolicyArg {
    /// Abort the whole run batch and error the job
    AbortBatch,
    /// Only fail the variant that declared the failure
    FailVariant,
}

impl From<FailurePolicyArg> for DeclaredFailurePolicy {
    fn from(arg: FailurePolicyArg) -> Self {
        match arg {
            FailurePolicyArg::AbortBatch => DeclaredFailurePolicy::AbortBatch,
            FailurePolicyArg::FailVariant => DeclaredFailurePolicy::FailVariant,
        }
    }
}

impl Cli {
    fn pipeline_config(&self) -> PipelineConfig {
        let mut paths = HostPaths::under(&self.host_base, self.docker_sock.clone());
        paths.key_file = self.key_file.clone();
        paths.crypto_key_file = self.crypto_key_file.clone();
        PipelineConfig::new(
            ScmSource {
                kind: self.scm.clone(),
                url: self.scm_url.clone(),
                reference: self.scm_reference.clone(),
            },
            self.project_id.clone(),
            JobId::from(self.job_id.as_str()),
            paths,
        )
    }

    fn exit_policy(&self) -> ExitCodePolicy {
        ExitCodePolicy {
            declared_failure_code: self.declared_failure_code,
            on_declared_failure: self.declared_failure_policy.into(),
        }
    }

    fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            wait_timeout: self.wait_timeout_secs.map(Duration::from_secs),
        }
    }

    fn docker(&self) -> DockerCliRuntime {
        let docker = DockerCliRuntime::new(self.docker_bin.clone());
        match &self.docker_host {
            Some(host) => docker.with_host(host.clone()),
            None => docker,
        }
    }
}

/// Make sure the job is recorded and still open.
async fn ensure_job(store: &dyn JobStore, config: &PipelineConfig) -> Result<()> {
    match store.get_job(&config.job_id).await {
        Ok(job) if job.status.is_terminal() => {
            bail!("job {} already finished as {}", job.job_id, job.status)
        }
        Ok(_) => Ok(()),
        Err(StorageError::JobNotFound { .. }) => store
            .create_job(JobRecord::new(
                config.job_id.clone(),
                config.project_id.clone(),
            ))
            .await
            .context("Failed to record job"),
        Err(e) => Err(e).context("Failed to load job"),
    }
}

fn prepare_host_folders(paths: &HostPaths) -> Result<()> {
    for dir in [&paths.source, &paths.work, &paths.meta, &paths.artifacts] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(())
}

/// Wire the real collaborators and drive the job to completion.
async fn run_job(
    cli: &Cli,
    config: Arc<PipelineConfig>,
    store: Arc<SurrealJobStore>,
) -> Result<()> {
    ensure_job(store.as_ref(), &config).await?;

    let sinks: Vec<Arc<dyn LogSink>> = vec![store.clone(), Arc::new(TracingLogSink)];
    let logs: Arc<dyn LogSink> = Arc::new(TeeLogSink::new(sinks));
    let docker = cli.docker();
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker.clone());
    let fetcher = Arc::new(ContainerFetcher::new(
        runtime.clone(),
        store.clone(),
        logs.clone(),
    ));

    let controller = PipelineController::new(
        config,
        Collaborators {
            store,
            logs,
            runtime,
            fetcher,
            builder: Arc::new(DockerImageBuilder::new(docker)),
        },
    )
    .with_exit_policy(cli.exit_policy())
    .with_runner_options(cli.runner_options());

    let result = controller.run().await.context("Pipeline failed")?;
    info!(
        job_id = %result.job_id,
        status = %result.status,
        duration_ms = result.duration_ms,
        "job finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let config = Arc::new(cli.pipeline_config());
    let (job_log, job_log_queue) =
        telemetry::job_log_layer(config.project_id.clone(), config.job_id.clone());
    telemetry::init_tracing(cli.json, level, Some(job_log));

    prepare_host_folders(&config.paths)?;

    let store = Arc::new(
        SurrealJobStore::from_env()
            .await
            .context("Failed to connect to quay database")?,
    );
    let forwarder = job_log_queue.spawn_forwarder(store.clone());

    let outcome = run_job(&cli, config, store).await;
    if let Err(e) = &outcome {
        error!("job errored: {e:#}");
    }
    forwarder.shutdown().await;
    outcome
}
