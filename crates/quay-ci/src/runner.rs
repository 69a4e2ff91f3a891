//! Concurrent run stage.
//!
//! Every ready variant gets its own task, which starts the variant's service
//! containers, links them into the main container, waits for it and tears
//! the whole group down again. Tasks report on two channels: one for
//! per-variant outcomes and one for fatal errors. The first fatal error
//! cancels every other task; the coordinator waits until each of them has
//! removed its containers before returning the error.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use quay_state::{JobStore, LogSink, VariantId, VariantStatus};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{self, PipelineConfig};
use crate::error::RunError;
use crate::logs::{forward_logs, LogSource};
use crate::runtime::{
    ContainerHandle, ContainerRuntime, ExitCodePolicy, ExitOutcome, RemoveOptions, RunOptions,
};

/// A variant whose image was built and which can be run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyVariant {
    pub variant_id: VariantId,
    pub number: u32,
    pub image: String,
}

/// Terminal state of one variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantOutcome {
    pub variant_id: VariantId,
    pub number: u32,
    pub status: VariantStatus,
}

/// Outcomes of a run batch that completed without a fatal error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Ordered by variant number
    pub outcomes: Vec<VariantOutcome>,
}

impl RunReport {
    pub fn any_succeeded(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.status == VariantStatus::Success)
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| o.status == VariantStatus::Success)
    }
}

/// Runner tuning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerOptions {
    /// Upper bound on a main container's lifetime. `None` waits forever.
    pub wait_timeout: Option<Duration>,
}

/// Runs every ready variant of a job at the same time.
#[derive(Clone)]
pub struct ConcurrentRunner {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn JobStore>,
    logs: Arc<dyn LogSink>,
    config: Arc<PipelineConfig>,
    policy: ExitCodePolicy,
    options: RunnerOptions,
}

impl ConcurrentRunner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn JobStore>,
        logs: Arc<dyn LogSink>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            runtime,
            store,
            logs,
            config,
            policy: ExitCodePolicy::default(),
            options: RunnerOptions::default(),
        }
    }

    pub fn with_exit_policy(mut self, policy: ExitCodePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    /// Run all `variants` concurrently.
    ///
    /// Ordinary failures only mark their variant `Failed`. Any fatal error
    /// (a declared failure, a runtime or store error, a timeout) cancels the
    /// other variants and is returned once every task has cleaned up.
    #[instrument(skip_all, fields(job_id = %self.config.job_id, variants = variants.len()))]
    pub async fn run(&self, variants: Vec<ReadyVariant>) -> Result<RunReport, RunError> {
        let total = variants.len();
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<VariantOutcome>();
        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<RunError>();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut tasks = JoinSet::new();
        for variant in variants {
            let runner = self.clone();
            let outcome_tx = outcome_tx.clone();
            let error_tx = error_tx.clone();
            let cancel = cancel_rx.clone();
            tasks.spawn(async move {
                match runner.run_variant(variant, cancel).await {
                    Ok(outcome) => {
                        let _ = outcome_tx.send(outcome);
                    }
                    Err(e) => {
                        let _ = error_tx.send(e);
                    }
                }
            });
        }
        drop(outcome_tx);
        drop(error_tx);

        let mut outcomes = Vec::with_capacity(total);
        let failure = loop {
            if outcomes.len() == total {
                break None;
            }
            tokio::select! {
                biased;
                Some(e) = error_rx.recv() => break Some(e),
                Some(outcome) = outcome_rx.recv() => outcomes.push(outcome),
                else => {
                    break Some(RunError::TaskLost(format!(
                        "{} of {total} variants reported",
                        outcomes.len()
                    )))
                }
            }
        };

        if failure.is_some() {
            let _ = cancel_tx.send(true);
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "variant task panicked");
            }
        }

        if let Some(e) = failure {
            while let Ok(other) = error_rx.try_recv() {
                if !matches!(other, RunError::Cancelled { .. }) {
                    warn!(error = %other, "additional run failure");
                }
            }
            error!(error = %e, "run batch aborted");
            return Err(e);
        }

        outcomes.sort_by_key(|o| o.number);
        let succeeded = outcomes
            .iter()
            .filter(|o| o.status == VariantStatus::Success)
            .count();
        info!(succeeded, total, "run batch finished");
        Ok(RunReport { outcomes })
    }

    async fn run_variant(
        &self,
        variant: ReadyVariant,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<VariantOutcome, RunError> {
        let number = variant.number;
        if is_cancelled(&cancel) {
            self.settle(&variant, VariantStatus::Errored).await;
            return Err(RunError::Cancelled { number });
        }
        self.store
            .update_variant_status(&variant.variant_id, VariantStatus::Running, None)
            .await
            .map_err(|source| RunError::Store { number, source })?;

        let mut group = ContainerGroup::default();
        let result = self.execute(&variant, &mut group, &mut cancel).await;

        let teardown = self.teardown(number, group).await;
        let status = match (&result, teardown) {
            (Ok(status), Ok(())) => *status,
            (Ok(_), Err(e)) => {
                self.settle(&variant, VariantStatus::Errored).await;
                return Err(e);
            }
            (Err(_), Ok(())) => VariantStatus::Errored,
            (Err(_), Err(e)) => {
                warn!(variant = number, error = %e, "teardown failed after run failure");
                VariantStatus::Errored
            }
        };

        if let Err(e) = result {
            self.settle(&variant, status).await;
            return Err(e);
        }
        self.store
            .update_variant_status(&variant.variant_id, status, Some(Utc::now()))
            .await
            .map_err(|source| RunError::Store { number, source })?;

        info!(variant = number, status = %status, "variant finished");
        Ok(VariantOutcome {
            variant_id: variant.variant_id,
            number,
            status,
        })
    }

    /// Start the services and the main container, then wait for it.
    async fn execute(
        &self,
        variant: &ReadyVariant,
        group: &mut ContainerGroup,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<VariantStatus, RunError> {
        let number = variant.number;
        let manifest = self.config.services_manifest(number);
        let services = read_services_manifest(&manifest)
            .await
            .map_err(|source| RunError::Manifest {
                number,
                path: manifest.clone(),
                source,
            })?;

        let mut links = Vec::with_capacity(services.len());
        for (index, service) in services.iter().enumerate() {
            if is_cancelled(cancel) {
                return Err(RunError::Cancelled { number });
            }
            let name = service_container_name(
                &self.config.project_id,
                self.config.job_id.as_str(),
                number,
                index,
            );
            let options = RunOptions {
                name: Some(name.clone()),
                image: service.clone(),
                env: self.config.env().clone(),
                volume_binds: Vec::new(),
                links: Vec::new(),
            };
            let handle = self
                .runtime
                .run(&options)
                .await
                .map_err(|source| RunError::Runtime { number, source })?;
            debug!(
                variant = number,
                service = %service,
                container = %name,
                "service started"
            );
            links.push(format!("{name}:{}", service_alias(service)));
            group.services.push(handle);
        }

        if is_cancelled(cancel) {
            return Err(RunError::Cancelled { number });
        }
        let options = RunOptions {
            name: None,
            image: variant.image.clone(),
            env: self.config.env().clone(),
            volume_binds: vec![config::bind(
                &self.config.variant_artifacts_dir(number),
                config::ARTIFACTS_MOUNT,
            )],
            links,
        };
        let main = self
            .runtime
            .run(&options)
            .await
            .map_err(|source| RunError::Runtime { number, source })?;
        let container_id = main.id.clone();
        info!(
            variant = number,
            container = %main.short_id(),
            image = %main.image,
            "variant started"
        );

        let exit = {
            let main = group.main.insert(main);
            let source = LogSource {
                project_id: self.config.project_id.clone(),
                job_id: self.config.job_id.clone(),
                variant_id: Some(variant.variant_id.clone()),
                image: variant.image.clone(),
            };
            tokio::select! {
                exit = self.observe(main, source, number) => exit,
                _ = cancelled(cancel) => Err(RunError::Cancelled { number }),
            }
        };

        let code = exit?;
        match ExitOutcome::classify(code, &self.policy) {
            ExitOutcome::Succeeded => Ok(VariantStatus::Success),
            ExitOutcome::Failed { code } => {
                info!(variant = number, code, "variant run failed");
                Ok(VariantStatus::Failed)
            }
            ExitOutcome::DeclaredFailure { code } => Err(RunError::DeclaredFailure {
                number,
                container_id,
                code,
            }),
        }
    }

    /// Forward the main container's logs and wait for its exit code.
    ///
    /// The code is only returned once the log stream has ended.
    async fn observe(
        &self,
        main: &ContainerHandle,
        source: LogSource,
        number: u32,
    ) -> Result<i64, RunError> {
        let stream = self
            .runtime
            .stream_logs(main)
            .await
            .map_err(|source| RunError::Runtime { number, source })?;

        let finished = async {
            let (_, code) = tokio::join!(
                forward_logs(stream, self.logs.clone(), source),
                self.runtime.wait(main)
            );
            code.map_err(|source| RunError::Runtime { number, source })
        };

        match self.options.wait_timeout {
            Some(timeout) => tokio::time::timeout(timeout, finished)
                .await
                .map_err(|_| RunError::WaitTimeout {
                    number,
                    container_id: main.id.clone(),
                    timeout,
                })?,
            None => finished.await,
        }
    }

    /// Remove the main container, then the services in start order.
    ///
    /// Every container is attempted; the first failure is returned.
    async fn teardown(&self, number: u32, group: ContainerGroup) -> Result<(), RunError> {
        let mut first_error = None;
        let handles = group.main.into_iter().chain(group.services);
        for handle in handles {
            let container_id = handle.id.clone();
            match self.runtime.remove(handle, RemoveOptions::purge()).await {
                Ok(()) => debug!(variant = number, container = %container_id, "container removed"),
                Err(source) => {
                    warn!(
                        variant = number,
                        container = %container_id,
                        error = %source,
                        "failed to remove container"
                    );
                    first_error.get_or_insert(RunError::Remove {
                        number,
                        container_id,
                        source,
                    });
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Record a terminal status on a failing path; the original error wins.
    async fn settle(&self, variant: &ReadyVariant, status: VariantStatus) {
        if let Err(e) = self
            .store
            .update_variant_status(&variant.variant_id, status, Some(Utc::now()))
            .await
        {
            warn!(variant = variant.number, error = %e, "failed to record variant status");
        }
    }
}

/// Containers a variant task has started and still owns.
#[derive(Default)]
struct ContainerGroup {
    main: Option<ContainerHandle>,
    services: Vec<ContainerHandle>,
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Read a variant's service manifest: one image per line.
///
/// A missing manifest declares no services. Blank lines are skipped.
pub async fn read_services_manifest(path: &Path) -> std::io::Result<Vec<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Name of the `index`-th service container of variant `number`.
///
/// Unique per job, variant and position, so variants that declare the same
/// image never collide.
pub fn service_container_name(
    project_id: &str,
    job_id: &str,
    number: u32,
    index: usize,
) -> String {
    sanitize_name(&format!("service-{project_id}-{job_id}-{number}-{index}"))
}

/// Alias a service is linked under: the image's repository basename.
///
/// `docker.io/library/postgres:16` links as `postgres`.
pub fn service_alias(image: &str) -> String {
    let without_digest = image.split('@').next().unwrap_or(image);
    let basename = without_digest.rsplit('/').next().unwrap_or(without_digest);
    let repository = basename.split(':').next().unwrap_or(basename);
    sanitize_name(repository)
}

/// Map a string onto Docker's container name alphabet `[a-zA-Z0-9_.-]`.
fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn service_names_include_variant_and_index() {
        assert_eq!(
            service_container_name("web", "job-1", 2, 0),
            "service-web-job-1-2-0"
        );
        assert_ne!(
            service_container_name("web", "job-1", 0, 0),
            service_container_name("web", "job-1", 1, 0)
        );
        assert_eq!(
            service_container_name("my app", "j/1", 0, 3),
            "service-my-app-j-1-0-3"
        );
    }

    #[test]
    fn alias_is_repository_basename() {
        assert_eq!(service_alias("redis"), "redis");
        assert_eq!(service_alias("postgres:16"), "postgres");
        assert_eq!(service_alias("docker.io/library/mysql:8.0"), "mysql");
        assert_eq!(service_alias("localhost:5000/team/cache"), "cache");
        assert_eq!(service_alias("mongo@sha256:abcd"), "mongo");
    }

    #[tokio::test]
    async fn missing_manifest_declares_no_services() {
        let tmp = TempDir::new().unwrap();
        let services = read_services_manifest(&tmp.path().join("services"))
            .await
            .unwrap();
        assert!(services.is_empty());
    }

    #[tokio::test]
    async fn manifest_lines_are_trimmed_and_blank_lines_skipped() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("services");
        std::fs::write(&path, "redis\n\n  postgres:16 \n").unwrap();

        let services = read_services_manifest(&path).await.unwrap();
        assert_eq!(services, vec!["redis", "postgres:16"]);
    }

    #[tokio::test]
    async fn unreadable_manifest_is_an_error() {
        let tmp = TempDir::new().unwrap();
        // A directory where the file should be
        let path = tmp.path().join("services");
        std::fs::create_dir(&path).unwrap();
        assert!(read_services_manifest(&path).await.is_err());
    }

    #[test]
    fn report_aggregates() {
        let outcome = |number, status| VariantOutcome {
            variant_id: VariantId::new(),
            number,
            status,
        };
        let report = RunReport {
            outcomes: vec![
                outcome(0, VariantStatus::Success),
                outcome(1, VariantStatus::Failed),
            ],
        };
        assert!(report.any_succeeded());
        assert!(!report.all_succeeded());
        assert!(!RunReport::default().any_succeeded());
    }
}
