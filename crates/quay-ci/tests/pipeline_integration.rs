//! End-to-end pipeline tests: every stage runs against the scripted
//! runtime, with the parser's output prepared on disk beforehand.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quay_ci::build::image_tag;
use quay_ci::fakes::{ScriptedBuilder, ScriptedRuntime, StaticFetcher};
use quay_ci::pipeline::PipelineState;
use quay_ci::{
    Collaborators, ContainerFetcher, HostPaths, PipelineConfig, PipelineController,
    PipelineError, RunError, ScmSource, SourceFetcher, Stage,
};
use quay_state::fakes::{MemoryJobStore, MemoryLogSink};
use quay_state::{
    JobId, JobRecord, JobStatus, JobStore, StorageError, StorageResult, VariantId, VariantRecord,
    VariantStatus,
};
use tempfile::TempDir;

const PROJECT: &str = "web";
const JOB: &str = "job-7";
const FETCHER: &str = "quay/scm-git:1";
const PARSER: &str = "quay/parser:1";

struct Harness {
    runtime: Arc<ScriptedRuntime>,
    store: Arc<MemoryJobStore>,
    logs: Arc<MemoryLogSink>,
    builder: Arc<ScriptedBuilder>,
    config: Arc<PipelineConfig>,
    _tmp: TempDir,
}

impl Harness {
    /// A job whose parser "emits" `variants` numbered folders.
    async fn new(variants: u32) -> Self {
        let tmp = TempDir::new().unwrap();
        let paths = HostPaths::under(tmp.path(), "/var/run/docker.sock");
        for number in 0..variants {
            let dir = paths.work.join(number.to_string());
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("Dockerfile"), "FROM rust:1.75\n").unwrap();
            std::fs::write(
                dir.join("meta.json"),
                format!(r#"{{"toolchain": "stable", "shard": {number}}}"#),
            )
            .unwrap();
        }

        let store = Arc::new(MemoryJobStore::new());
        store
            .create_job(JobRecord::new(JobId::from(JOB), PROJECT))
            .await
            .unwrap();
        store.register_image("scm-git", FETCHER).await.unwrap();
        store.register_image("parser", PARSER).await.unwrap();

        let config = PipelineConfig::new(
            ScmSource {
                kind: "git".to_string(),
                url: "https://example.com/web.git".to_string(),
                reference: "refs/heads/main".to_string(),
            },
            PROJECT,
            JobId::from(JOB),
            paths,
        );

        Self {
            runtime: Arc::new(ScriptedRuntime::new()),
            store,
            logs: Arc::new(MemoryLogSink::new()),
            builder: Arc::new(ScriptedBuilder::new()),
            config: Arc::new(config),
            _tmp: tmp,
        }
    }

    fn fetcher(&self) -> Arc<dyn SourceFetcher> {
        Arc::new(ContainerFetcher::new(
            self.runtime.clone(),
            self.store.clone(),
            self.logs.clone(),
        ))
    }

    fn controller_with(
        &self,
        store: Arc<dyn JobStore>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> PipelineController {
        PipelineController::new(
            self.config.clone(),
            Collaborators {
                store,
                logs: self.logs.clone(),
                runtime: self.runtime.clone(),
                fetcher,
                builder: self.builder.clone(),
            },
        )
    }

    fn controller(&self) -> PipelineController {
        self.controller_with(self.store.clone(), self.fetcher())
    }

    async fn job_status(&self) -> JobStatus {
        self.store.get_job(&JobId::from(JOB)).await.unwrap().status
    }

    async fn variant_statuses(&self) -> Vec<VariantStatus> {
        self.store
            .list_variants(&JobId::from(JOB))
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.status)
            .collect()
    }
}

fn image(number: u32) -> String {
    image_tag(PROJECT, JOB, number)
}

#[tokio::test]
async fn all_variants_pass() {
    let h = Harness::new(2).await;
    h.runtime.print(PARSER, &["found 2 variants"]);

    let result = h.controller().run().await.unwrap();

    assert_eq!(result.status, JobStatus::Success);
    assert_eq!(result.succeeded_count(), 2);
    assert_eq!(h.job_status().await, JobStatus::Success);
    assert!(h.store.get_job(&JobId::from(JOB)).await.unwrap().completed_at.is_some());
    assert_eq!(
        h.variant_statuses().await,
        vec![VariantStatus::Success, VariantStatus::Success]
    );

    let variants = h.store.list_variants(&JobId::from(JOB)).await.unwrap();
    assert_eq!(variants[1].metas["shard"], 1);
    assert_eq!(variants[0].image.as_deref(), Some(image(0).as_str()));

    // Fetcher and parser containers were cleaned up too
    let removed = h.runtime.removed_images();
    assert_eq!(&removed[..2], &[FETCHER.to_string(), PARSER.to_string()]);
    assert!(h.runtime.live_containers().is_empty());
    assert_eq!(h.logs.messages_for(PARSER), vec!["found 2 variants"]);
}

#[tokio::test]
async fn ordinary_failure_fails_the_job_cleanly() {
    let h = Harness::new(2).await;
    h.runtime.exit_with(&image(1), 7);

    let result = h.controller().run().await.unwrap();

    assert_eq!(result.status, JobStatus::Failed);
    assert_eq!(result.failed_count(), 1);
    assert_eq!(h.job_status().await, JobStatus::Failed);
    assert_eq!(
        h.variant_statuses().await,
        vec![VariantStatus::Success, VariantStatus::Failed]
    );
}

#[tokio::test]
async fn fetch_failure_errors_the_job() {
    let h = Harness::new(1).await;
    h.runtime.exit_with(FETCHER, 128);

    let err = h.controller().run().await.unwrap_err();

    match err {
        PipelineError::Stage(e) => {
            assert_eq!(e.stage, Stage::Fetch);
            assert!(e.container_id.is_some());
        }
        other => panic!("expected fetch failure, got {other}"),
    }
    assert_eq!(h.job_status().await, JobStatus::Errored);
    assert!(h.variant_statuses().await.is_empty());
    assert_eq!(h.runtime.live_containers(), vec![FETCHER.to_string()]);
}

#[tokio::test]
async fn unregistered_fetcher_image_errors_the_job() {
    let h = Harness::new(1).await;
    let config = PipelineConfig::new(
        ScmSource {
            kind: "hg".to_string(),
            url: "https://example.com/web".to_string(),
            reference: "default".to_string(),
        },
        PROJECT,
        JobId::from(JOB),
        h.config.paths.clone(),
    );
    let controller = PipelineController::new(
        Arc::new(config),
        Collaborators {
            store: h.store.clone(),
            logs: h.logs.clone(),
            runtime: h.runtime.clone(),
            fetcher: h.fetcher(),
            builder: h.builder.clone(),
        },
    );

    let err = controller.run().await.unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Fetch));
    assert!(err.to_string().contains("scm-hg"));
    assert!(h.runtime.events().is_empty());
}

#[tokio::test]
async fn parser_failure_keeps_its_container() {
    let h = Harness::new(1).await;
    h.runtime.exit_with(PARSER, 1);

    let err = h.controller().run().await.unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Parse));
    assert_eq!(h.job_status().await, JobStatus::Errored);
    assert_eq!(h.runtime.live_containers(), vec![PARSER.to_string()]);
    assert!(h.builder.built().is_empty());
}

#[tokio::test]
async fn parser_without_variants_errors_the_job() {
    let h = Harness::new(0).await;

    let err = h.controller().run().await.unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Parse));
    assert_eq!(h.job_status().await, JobStatus::Errored);
}

#[tokio::test]
async fn failed_build_excludes_only_that_variant() {
    let h = Harness::new(3).await;
    h.builder.fail_variant(1);

    let result = h.controller().run().await.unwrap();

    assert_eq!(result.status, JobStatus::Errored);
    assert_eq!(
        h.variant_statuses().await,
        vec![
            VariantStatus::Success,
            VariantStatus::Errored,
            VariantStatus::Success
        ]
    );
    let run_images: Vec<String> = h
        .runtime
        .started()
        .into_iter()
        .map(|o| o.image)
        .filter(|i| i.starts_with("quay-"))
        .collect();
    assert_eq!(run_images.len(), 2);
    assert!(!run_images.contains(&image(1)));
}

#[tokio::test]
async fn all_builds_failing_skips_the_run_stage() {
    let h = Harness::new(2).await;
    h.builder.fail_variant(0);
    h.builder.fail_variant(1);

    let result = h.controller().run().await.unwrap();

    assert_eq!(result.status, JobStatus::Errored);
    assert_eq!(result.errored_count(), 2);
    assert_eq!(h.builder.built(), vec![0, 1]);
    // Only the fetcher and the parser ever ran
    assert_eq!(h.runtime.started().len(), 2);
}

#[tokio::test]
async fn broken_builder_errors_job_and_variants() {
    let h = Harness::new(2).await;
    h.builder.break_builder("docker: command not found");

    let err = h.controller().run().await.unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Build));
    assert_eq!(h.job_status().await, JobStatus::Errored);
    assert_eq!(
        h.variant_statuses().await,
        vec![VariantStatus::Errored, VariantStatus::Errored]
    );
}

#[tokio::test]
async fn declared_failure_errors_the_job() {
    let h = Harness::new(2).await;
    h.runtime.exit_with(&image(0), 42);

    let err = h.controller().run().await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Run(RunError::DeclaredFailure { number: 0, .. })
    ));
    assert_eq!(h.job_status().await, JobStatus::Errored);
    assert!(h
        .variant_statuses()
        .await
        .iter()
        .all(|status| status.is_terminal()));
    assert!(h.runtime.live_containers().is_empty());
}

#[tokio::test]
async fn static_fetcher_failure_is_fatal() {
    let h = Harness::new(1).await;
    let controller =
        h.controller_with(h.store.clone(), Arc::new(StaticFetcher::failing("auth denied")));

    let err = controller.run().await.unwrap_err();

    assert_eq!(err.to_string(), "fetch stage failed: auth denied");
    assert_eq!(h.job_status().await, JobStatus::Errored);
}

#[tokio::test]
async fn stepping_walks_every_stage_in_order() {
    let h = Harness::new(2).await;
    let controller = h.controller();

    let state = controller.step(PipelineState::Fetching).await.unwrap();
    assert_eq!(state, PipelineState::Parsing);

    let state = controller.step(state).await.unwrap();
    let PipelineState::Building { variants } = &state else {
        panic!("expected Building, got {state:?}");
    };
    assert_eq!(variants.len(), 2);
    assert_eq!(
        h.variant_statuses().await,
        vec![VariantStatus::Pending, VariantStatus::Pending]
    );

    let state = controller.step(state).await.unwrap();
    let PipelineState::Running { ready, settled } = &state else {
        panic!("expected Running, got {state:?}");
    };
    assert_eq!(ready.len(), 2);
    assert!(settled.is_empty());

    let state = controller.step(state).await.unwrap();
    let PipelineState::Finished { variants } = &state else {
        panic!("expected Finished, got {state:?}");
    };
    assert!(variants.iter().all(|v| v.status == VariantStatus::Success));

    // Finished is a fixed point and the job is still open until run() finishes it
    let again = controller.step(state.clone()).await.unwrap();
    assert_eq!(again, state);
    assert_eq!(h.job_status().await, JobStatus::Running);
}

#[tokio::test]
async fn failing_to_record_the_error_reports_both() {
    let h = Harness::new(1).await;
    h.runtime.exit_with(PARSER, 3);
    let store = Arc::new(UnfinishableStore(h.store.clone()));
    let fetcher = Arc::new(ContainerFetcher::new(
        h.runtime.clone(),
        store.clone(),
        h.logs.clone(),
    ));

    let err = h.controller_with(store, fetcher).run().await.unwrap_err();

    match &err {
        PipelineError::Persistence { original, .. } => {
            assert_eq!(original.stage(), Some(Stage::Parse));
        }
        other => panic!("expected persistence failure, got {other}"),
    }
    assert_eq!(err.stage(), Some(Stage::Parse));
    assert_eq!(h.job_status().await, JobStatus::Running);
}

/// Store whose `finish_job` always fails.
struct UnfinishableStore(Arc<MemoryJobStore>);

#[async_trait]
impl JobStore for UnfinishableStore {
    async fn create_job(&self, job: JobRecord) -> StorageResult<()> {
        self.0.create_job(job).await
    }

    async fn get_job(&self, job_id: &JobId) -> StorageResult<JobRecord> {
        self.0.get_job(job_id).await
    }

    async fn finish_job(
        &self,
        _job_id: &JobId,
        _status: JobStatus,
        _completed_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        Err(StorageError::Backend("connection refused".to_string()))
    }

    async fn create_variant(&self, variant: VariantRecord) -> StorageResult<()> {
        self.0.create_variant(variant).await
    }

    async fn get_variant(&self, variant_id: &VariantId) -> StorageResult<VariantRecord> {
        self.0.get_variant(variant_id).await
    }

    async fn list_variants(&self, job_id: &JobId) -> StorageResult<Vec<VariantRecord>> {
        self.0.list_variants(job_id).await
    }

    async fn update_variant_status(
        &self,
        variant_id: &VariantId,
        status: VariantStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> StorageResult<()> {
        self.0
            .update_variant_status(variant_id, status, completed_at)
            .await
    }

    async fn set_variant_image(&self, variant_id: &VariantId, image: &str) -> StorageResult<()> {
        self.0.set_variant_image(variant_id, image).await
    }

    async fn register_image(&self, role: &str, image: &str) -> StorageResult<()> {
        self.0.register_image(role, image).await
    }

    async fn resolve_image(&self, role: &str) -> StorageResult<String> {
        self.0.resolve_image(role).await
    }
}
