//! Pipeline controller: Fetch -> Parse -> Build -> Run.
//!
//! The controller is an explicit state machine. [`PipelineController::step`]
//! performs exactly one stage and returns the next state; fatal errors end
//! the pipeline after the job has been recorded as errored.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use quay_state::{JobId, JobStatus, JobStore, LogSink, VariantId, VariantRecord, VariantStatus};
use tracing::{error, info, instrument, warn};

use crate::build::{BuildOutcome, ImageBuilder};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::fetch::SourceFetcher;
use crate::parser::{ConfigParser, VariantSpec};
use crate::runner::{ConcurrentRunner, ReadyVariant, RunnerOptions, VariantOutcome};
use crate::runtime::{ContainerRuntime, ExitCodePolicy};
use crate::stage::Stage;

/// A parsed variant with its persisted record.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedVariant {
    pub variant_id: VariantId,
    pub spec: VariantSpec,
}

/// Where the pipeline is. States only ever move forward.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    Fetching,
    Parsing,
    Building {
        variants: Vec<ParsedVariant>,
    },
    Running {
        ready: Vec<ReadyVariant>,
        /// Variants already terminal, i.e. failed builds
        settled: Vec<VariantOutcome>,
    },
    Finished {
        variants: Vec<VariantOutcome>,
    },
}

impl PipelineState {
    /// Stage executed when leaving this state.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Fetching => Some(Stage::Fetch),
            PipelineState::Parsing => Some(Stage::Parse),
            PipelineState::Building { .. } => Some(Stage::Build),
            PipelineState::Running { .. } => Some(Stage::Run),
            PipelineState::Finished { .. } => None,
        }
    }
}

/// Milliseconds in `elapsed`, saturating at `u64::MAX`.
fn whole_millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Job status from the terminal statuses of its variants.
///
/// Errored beats Failed, which beats Success.
pub fn aggregate_job_status(statuses: &[VariantStatus]) -> JobStatus {
    if statuses.contains(&VariantStatus::Errored) {
        JobStatus::Errored
    } else if statuses.contains(&VariantStatus::Failed) {
        JobStatus::Failed
    } else {
        JobStatus::Success
    }
}

/// Result of a pipeline that ran to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResult {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Ordered by variant number
    pub variants: Vec<VariantOutcome>,
    pub duration_ms: u64,
}

impl PipelineResult {
    pub fn succeeded_count(&self) -> usize {
        self.count(VariantStatus::Success)
    }

    pub fn failed_count(&self) -> usize {
        self.count(VariantStatus::Failed)
    }

    pub fn errored_count(&self) -> usize {
        self.count(VariantStatus::Errored)
    }

    fn count(&self, status: VariantStatus) -> usize {
        self.variants.iter().filter(|v| v.status == status).count()
    }
}

/// External collaborators of a pipeline.
pub struct Collaborators {
    pub store: Arc<dyn JobStore>,
    pub logs: Arc<dyn LogSink>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub builder: Arc<dyn ImageBuilder>,
}

/// Drives one job through every stage.
pub struct PipelineController {
    config: Arc<PipelineConfig>,
    store: Arc<dyn JobStore>,
    fetcher: Arc<dyn SourceFetcher>,
    parser: ConfigParser,
    builder: Arc<dyn ImageBuilder>,
    runner: ConcurrentRunner,
}

impl PipelineController {
    pub fn new(config: Arc<PipelineConfig>, deps: Collaborators) -> Self {
        let parser = ConfigParser::new(
            deps.runtime.clone(),
            deps.store.clone(),
            deps.logs.clone(),
        );
        let runner = ConcurrentRunner::new(
            deps.runtime,
            deps.store.clone(),
            deps.logs,
            config.clone(),
        );
        Self {
            config,
            store: deps.store,
            fetcher: deps.fetcher,
            parser,
            builder: deps.builder,
            runner,
        }
    }

    pub fn with_exit_policy(mut self, policy: ExitCodePolicy) -> Self {
        self.runner = self.runner.with_exit_policy(policy);
        self
    }

    pub fn with_runner_options(mut self, options: RunnerOptions) -> Self {
        self.runner = self.runner.with_options(options);
        self
    }

    /// Run every stage and record the job's final status.
    ///
    /// The job record must already exist. On error the job has been
    /// finished as `Errored`, unless that itself failed, in which case the
    /// error is [`PipelineError::Persistence`].
    #[instrument(
        skip_all,
        fields(job_id = %self.config.job_id, project = %self.config.project_id)
    )]
    pub async fn run(&self) -> Result<PipelineResult, PipelineError> {
        let started = Instant::now();
        info!("starting pipeline");

        let mut state = PipelineState::Fetching;
        loop {
            state = match state {
                PipelineState::Finished { variants } => {
                    return match self.finish(variants, started).await {
                        Ok(result) => Ok(result),
                        Err(e) => Err(self.abort(e).await),
                    };
                }
                current => match self.step(current).await {
                    Ok(next) => next,
                    Err(e) => return Err(self.abort(e).await),
                },
            };
        }
    }

    /// Execute the stage belonging to `state` and return the next state.
    pub async fn step(&self, state: PipelineState) -> Result<PipelineState, PipelineError> {
        match state {
            PipelineState::Fetching => {
                info!(stage = %Stage::Fetch, "entering stage");
                self.fetcher.fetch(&self.config).await?;
                Ok(PipelineState::Parsing)
            }
            PipelineState::Parsing => {
                info!(stage = %Stage::Parse, "entering stage");
                let specs = self.parser.parse(&self.config).await?;
                let variants = self.register_variants(specs).await?;
                Ok(PipelineState::Building { variants })
            }
            PipelineState::Building { variants } => {
                info!(stage = %Stage::Build, variants = variants.len(), "entering stage");
                self.build(variants).await
            }
            PipelineState::Running { ready, mut settled } => {
                info!(stage = %Stage::Run, ready = ready.len(), "entering stage");
                if !ready.is_empty() {
                    let report = self.runner.run(ready).await?;
                    settled.extend(report.outcomes);
                }
                settled.sort_by_key(|v| v.number);
                Ok(PipelineState::Finished { variants: settled })
            }
            finished @ PipelineState::Finished { .. } => Ok(finished),
        }
    }

    async fn register_variants(
        &self,
        specs: Vec<VariantSpec>,
    ) -> Result<Vec<ParsedVariant>, PipelineError> {
        let mut variants = Vec::with_capacity(specs.len());
        for spec in specs {
            let record = VariantRecord::new(
                self.config.job_id.clone(),
                self.config.project_id.clone(),
                spec.number,
                spec.metas.clone(),
            );
            let variant_id = record.variant_id.clone();
            self.store.create_variant(record).await?;
            variants.push(ParsedVariant { variant_id, spec });
        }
        Ok(variants)
    }

    async fn build(&self, variants: Vec<ParsedVariant>) -> Result<PipelineState, PipelineError> {
        let mut ready = Vec::new();
        let mut settled = Vec::new();
        for variant in variants {
            match self.builder.build(&self.config, &variant.spec).await? {
                BuildOutcome::Built { number, image } => {
                    self.store
                        .set_variant_image(&variant.variant_id, &image)
                        .await?;
                    ready.push(ReadyVariant {
                        variant_id: variant.variant_id,
                        number,
                        image,
                    });
                }
                BuildOutcome::Failed { number, reason } => {
                    warn!(variant = number, reason = %reason, "variant excluded from run");
                    self.store
                        .update_variant_status(
                            &variant.variant_id,
                            VariantStatus::Errored,
                            Some(Utc::now()),
                        )
                        .await?;
                    settled.push(VariantOutcome {
                        variant_id: variant.variant_id,
                        number,
                        status: VariantStatus::Errored,
                    });
                }
            }
        }
        Ok(PipelineState::Running { ready, settled })
    }

    async fn finish(
        &self,
        variants: Vec<VariantOutcome>,
        started: Instant,
    ) -> Result<PipelineResult, PipelineError> {
        if let Some(unsettled) = variants.iter().find(|v| !v.status.is_terminal()) {
            return Err(PipelineError::UnsettledVariant {
                number: unsettled.number,
                status: unsettled.status,
            });
        }

        let statuses: Vec<VariantStatus> = variants.iter().map(|v| v.status).collect();
        let status = aggregate_job_status(&statuses);
        self.store
            .finish_job(&self.config.job_id, status, Utc::now())
            .await?;

        let result = PipelineResult {
            job_id: self.config.job_id.clone(),
            status,
            variants,
            duration_ms: whole_millis(started.elapsed()),
        };
        info!(
            status = %result.status,
            succeeded = result.succeeded_count(),
            failed = result.failed_count(),
            errored = result.errored_count(),
            duration_ms = result.duration_ms,
            "pipeline finished"
        );
        Ok(result)
    }

    /// Record the job as errored and hand back the error to report.
    async fn abort(&self, err: PipelineError) -> PipelineError {
        error!(stage = ?err.stage(), error = %err, "pipeline failed");
        self.settle_leftover_variants().await;

        match self
            .store
            .finish_job(&self.config.job_id, JobStatus::Errored, Utc::now())
            .await
        {
            Ok(()) => err,
            Err(source) => PipelineError::Persistence {
                original: Box::new(err),
                source,
            },
        }
    }

    /// Mark variants a failed pipeline never finished as errored.
    async fn settle_leftover_variants(&self) {
        let variants = match self.store.list_variants(&self.config.job_id).await {
            Ok(variants) => variants,
            Err(e) => {
                warn!(error = %e, "cannot list variants of failed job");
                return;
            }
        };
        for variant in variants.into_iter().filter(|v| !v.status.is_terminal()) {
            if let Err(e) = self
                .store
                .update_variant_status(
                    &variant.variant_id,
                    VariantStatus::Errored,
                    Some(Utc::now()),
                )
                .await
            {
                warn!(variant = variant.number, error = %e, "cannot mark variant errored");
            }
        }
    }
}
