//! Integration tests for the concurrent run stage.
//!
//! Every test runs real runner tasks against `ScriptedRuntime` and the
//! in-memory store, then inspects container lifecycles and variant records.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quay_ci::build::image_tag;
use quay_ci::fakes::{ExitScript, ScriptedRuntime};
use quay_ci::{
    ConcurrentRunner, DeclaredFailurePolicy, ExitCodePolicy, HostPaths, PipelineConfig,
    ReadyVariant, RunError, RunnerOptions, ScmSource,
};
use quay_state::fakes::{MemoryJobStore, MemoryLogSink};
use quay_state::{JobId, JobRecord, JobStore, VariantRecord, VariantStatus};
use tempfile::TempDir;

const PROJECT: &str = "web";
const JOB: &str = "job-1";

struct Harness {
    runtime: Arc<ScriptedRuntime>,
    store: Arc<MemoryJobStore>,
    logs: Arc<MemoryLogSink>,
    config: Arc<PipelineConfig>,
    _tmp: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let config = PipelineConfig::new(
            ScmSource {
                kind: "git".to_string(),
                url: "https://example.com/web.git".to_string(),
                reference: "main".to_string(),
            },
            PROJECT,
            JobId::from(JOB),
            HostPaths::under(tmp.path(), "/var/run/docker.sock"),
        );
        let store = Arc::new(MemoryJobStore::new());
        store
            .create_job(JobRecord::new(JobId::from(JOB), PROJECT))
            .await
            .unwrap();

        Self {
            runtime: Arc::new(ScriptedRuntime::new()),
            store,
            logs: Arc::new(MemoryLogSink::new()),
            config: Arc::new(config),
            _tmp: tmp,
        }
    }

    fn runner(&self) -> ConcurrentRunner {
        ConcurrentRunner::new(
            self.runtime.clone(),
            self.store.clone(),
            self.logs.clone(),
            self.config.clone(),
        )
    }

    /// Persist variant `number` and write its service manifest.
    async fn variant(&self, number: u32, services: &[&str]) -> ReadyVariant {
        let record = VariantRecord::new(JobId::from(JOB), PROJECT, number, Default::default());
        let variant_id = record.variant_id.clone();
        self.store.create_variant(record).await.unwrap();

        if !services.is_empty() {
            let manifest = self.config.services_manifest(number);
            write(&manifest, &services.join("\n"));
        }
        ReadyVariant {
            variant_id,
            number,
            image: image(number),
        }
    }

    async fn status(&self, variant: &ReadyVariant) -> VariantStatus {
        self.store
            .get_variant(&variant.variant_id)
            .await
            .unwrap()
            .status
    }
}

fn image(number: u32) -> String {
    image_tag(PROJECT, JOB, number)
}

fn write(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[tokio::test]
async fn two_variants_with_mixed_exits() {
    let h = Harness::new().await;
    let a = h.variant(0, &["redis:7"]).await;
    let b = h.variant(1, &[]).await;
    h.runtime.print(&a.image, &["running tests", "ok"]);
    h.runtime.exit_with(&b.image, 7);

    let report = h.runner().run(vec![a.clone(), b.clone()]).await.unwrap();

    let statuses: Vec<_> = report.outcomes.iter().map(|o| o.status).collect();
    assert_eq!(statuses, vec![VariantStatus::Success, VariantStatus::Failed]);
    assert!(report.any_succeeded());
    assert!(!report.all_succeeded());

    assert_eq!(h.status(&a).await, VariantStatus::Success);
    assert_eq!(h.status(&b).await, VariantStatus::Failed);

    let removed = h.runtime.removed_images();
    assert_eq!(removed.iter().filter(|i| **i == a.image).count(), 1);
    assert_eq!(removed.iter().filter(|i| *i == "redis:7").count(), 1);
    assert_eq!(removed.iter().filter(|i| **i == b.image).count(), 1);
    assert_eq!(removed.len(), 3);
    assert!(h.runtime.live_containers().is_empty());

    assert_eq!(h.logs.messages_for(&a.image), vec!["running tests", "ok"]);
    assert!(h
        .logs
        .entries()
        .iter()
        .all(|e| e.variant_id.as_ref() == Some(&a.variant_id)));
}

#[tokio::test]
async fn services_are_named_and_linked() {
    let h = Harness::new().await;
    let v = h.variant(2, &["postgres:16", "docker.io/library/redis"]).await;

    h.runner().run(vec![v.clone()]).await.unwrap();

    let started = h.runtime.started();
    assert_eq!(started.len(), 3);
    assert_eq!(started[0].name.as_deref(), Some("service-web-job-1-2-0"));
    assert_eq!(started[1].name.as_deref(), Some("service-web-job-1-2-1"));

    let main = &started[2];
    assert_eq!(main.image, v.image);
    assert_eq!(
        main.links,
        vec![
            "service-web-job-1-2-0:postgres".to_string(),
            "service-web-job-1-2-1:redis".to_string(),
        ]
    );
    let artifacts = format!("{}:/artifacts", h.config.variant_artifacts_dir(2).display());
    assert_eq!(main.volume_binds, vec![artifacts]);
    assert!(started
        .iter()
        .all(|options| options.env.get("QUAY_JOB_ID").map(String::as_str) == Some(JOB)));
}

#[tokio::test]
async fn main_container_is_removed_before_its_services() {
    let h = Harness::new().await;
    let v = h.variant(0, &["redis", "memcached"]).await;

    h.runner().run(vec![v.clone()]).await.unwrap();

    assert_eq!(
        h.runtime.removed_images(),
        vec![v.image.clone(), "redis".to_string(), "memcached".to_string()]
    );
}

#[tokio::test]
async fn missing_manifest_runs_main_container_alone() {
    let h = Harness::new().await;
    let v = h.variant(0, &[]).await;

    let report = h.runner().run(vec![v.clone()]).await.unwrap();

    let started = h.runtime.started();
    assert_eq!(started.len(), 1);
    assert!(started[0].links.is_empty());
    assert!(report.all_succeeded());
}

#[tokio::test]
async fn same_service_in_two_variants_gets_distinct_containers() {
    let h = Harness::new().await;
    let a = h.variant(0, &["postgres:16"]).await;
    let b = h.variant(1, &["postgres:16"]).await;
    h.runtime.script(
        &a.image,
        ExitScript::Delayed {
            code: 0,
            after: Duration::from_millis(20),
        },
    );
    h.runtime.script(
        &b.image,
        ExitScript::Delayed {
            code: 0,
            after: Duration::from_millis(20),
        },
    );

    let report = h.runner().run(vec![a, b]).await.unwrap();

    assert!(report.all_succeeded());
    let mut names: Vec<String> = h
        .runtime
        .started()
        .into_iter()
        .filter(|o| o.image == "postgres:16")
        .filter_map(|o| o.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["service-web-job-1-0-0", "service-web-job-1-1-0"]);
}

#[tokio::test]
async fn declared_failure_aborts_the_batch() {
    let h = Harness::new().await;
    let a = h.variant(0, &["redis"]).await;
    let b = h.variant(1, &[]).await;
    h.runtime.exit_with(&a.image, 42);

    let err = h.runner().run(vec![a.clone(), b.clone()]).await.unwrap_err();

    match err {
        RunError::DeclaredFailure { number, code, .. } => {
            assert_eq!(number, 0);
            assert_eq!(code, 42);
        }
        other => panic!("expected declared failure, got {other}"),
    }
    assert_eq!(h.status(&a).await, VariantStatus::Errored);
    assert!(h.status(&b).await.is_terminal());
    assert!(h.runtime.live_containers().is_empty());
}

#[tokio::test]
async fn early_abort_leaves_no_containers_behind() {
    let h = Harness::new().await;
    let failing = h.variant(0, &[]).await;
    let hanging = h.variant(1, &["redis", "postgres"]).await;
    h.runtime.script(
        &failing.image,
        ExitScript::Delayed {
            code: 42,
            after: Duration::from_millis(50),
        },
    );
    h.runtime.script(&hanging.image, ExitScript::Hang);

    let err = h
        .runner()
        .run(vec![failing.clone(), hanging.clone()])
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::DeclaredFailure { number: 0, .. }));
    assert!(h.runtime.live_containers().is_empty());
    assert_eq!(h.status(&hanging).await, VariantStatus::Errored);
    assert!(h
        .runtime
        .removed_images()
        .contains(&"postgres".to_string()));
}

#[tokio::test]
async fn fail_variant_policy_keeps_the_batch_going() {
    let h = Harness::new().await;
    let a = h.variant(0, &[]).await;
    let b = h.variant(1, &[]).await;
    h.runtime.exit_with(&a.image, 42);

    let report = h
        .runner()
        .with_exit_policy(ExitCodePolicy {
            on_declared_failure: DeclaredFailurePolicy::FailVariant,
            ..ExitCodePolicy::default()
        })
        .run(vec![a.clone(), b.clone()])
        .await
        .unwrap();

    assert_eq!(h.status(&a).await, VariantStatus::Failed);
    assert_eq!(h.status(&b).await, VariantStatus::Success);
    assert!(report.any_succeeded());
}

#[tokio::test]
async fn removal_failure_is_fatal() {
    let h = Harness::new().await;
    let v = h.variant(0, &["redis"]).await;
    h.runtime.fail_remove("redis");

    let err = h.runner().run(vec![v.clone()]).await.unwrap_err();

    match err {
        RunError::Remove { number, .. } => assert_eq!(number, 0),
        other => panic!("expected removal error, got {other}"),
    }
    assert_eq!(h.status(&v).await, VariantStatus::Errored);
    // The main container still went first
    assert_eq!(h.runtime.removed_images(), vec![v.image.clone()]);
}

#[tokio::test]
async fn service_start_failure_cleans_up_started_services() {
    let h = Harness::new().await;
    let v = h.variant(0, &["redis", "ghost:1"]).await;
    h.runtime.fail_run("ghost:1");

    let err = h.runner().run(vec![v.clone()]).await.unwrap_err();

    assert!(matches!(err, RunError::Runtime { number: 0, .. }));
    assert!(h.runtime.live_containers().is_empty());
    assert_eq!(h.runtime.removed_images(), vec!["redis".to_string()]);
    assert_eq!(h.status(&v).await, VariantStatus::Errored);
}

#[tokio::test]
async fn wait_error_is_fatal() {
    let h = Harness::new().await;
    let v = h.variant(0, &[]).await;
    h.runtime.script(&v.image, ExitScript::WaitError);

    let err = h.runner().run(vec![v]).await.unwrap_err();

    assert!(matches!(err, RunError::Runtime { number: 0, .. }));
    assert!(h.runtime.live_containers().is_empty());
}

#[tokio::test]
async fn unreadable_manifest_is_fatal() {
    let h = Harness::new().await;
    let v = h.variant(0, &[]).await;
    std::fs::create_dir_all(h.config.services_manifest(0)).unwrap();

    let err = h.runner().run(vec![v]).await.unwrap_err();

    assert!(matches!(err, RunError::Manifest { number: 0, .. }));
    assert!(h.runtime.started().is_empty());
}

#[tokio::test(start_paused = true)]
async fn timeout_is_distinct_from_failure() {
    let h = Harness::new().await;
    let slow = h.variant(0, &[]).await;
    h.runtime.script(
        &slow.image,
        ExitScript::Delayed {
            code: 1,
            after: Duration::from_secs(10),
        },
    );
    let options = RunnerOptions {
        wait_timeout: Some(Duration::from_secs(30)),
    };

    let report = h
        .runner()
        .with_options(options)
        .run(vec![slow.clone()])
        .await
        .unwrap();
    assert_eq!(report.outcomes[0].status, VariantStatus::Failed);

    let stuck = h.variant(1, &["redis"]).await;
    h.runtime.script(&stuck.image, ExitScript::Hang);

    let err = h
        .runner()
        .with_options(options)
        .run(vec![stuck.clone()])
        .await
        .unwrap_err();

    match err {
        RunError::WaitTimeout {
            number, timeout, ..
        } => {
            assert_eq!(number, 1);
            assert_eq!(timeout, Duration::from_secs(30));
        }
        other => panic!("expected timeout, got {other}"),
    }
    assert_eq!(h.status(&stuck).await, VariantStatus::Errored);
    assert!(h.runtime.live_containers().is_empty());
}

#[tokio::test]
async fn empty_batch_reports_nothing() {
    let h = Harness::new().await;
    let report = h.runner().run(Vec::new()).await.unwrap();
    assert!(report.outcomes.is_empty());
    assert!(h.runtime.events().is_empty());
}
