//! Scripted fakes for tests.
//!
//! [`ScriptedRuntime`] behaves like a container daemon whose containers exit
//! with pre-programmed codes, and records every run and removal so tests can
//! check ordering, naming and leaks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::build::{image_tag, BuildOutcome, ImageBuilder};
use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::fetch::SourceFetcher;
use crate::parser::VariantSpec;
use crate::runtime::{
    ContainerHandle, ContainerRuntime, LogStream, RemoveOptions, RunOptions, RuntimeError,
    RuntimeResult,
};
use crate::stage::Stage;

/// How a scripted container exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitScript {
    Code(i64),
    /// Exit with `code` after `after` has elapsed
    Delayed { code: i64, after: Duration },
    /// Never exit
    Hang,
    /// `wait` itself fails
    WaitError,
}

/// Something the runtime was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    Run {
        id: String,
        name: Option<String>,
        image: String,
        links: Vec<String>,
        volume_binds: Vec<String>,
        env: BTreeMap<String, String>,
    },
    Remove {
        id: String,
        image: String,
    },
}

#[derive(Default)]
struct ScriptState {
    next_id: u64,
    exits: HashMap<String, ExitScript>,
    logs: HashMap<String, Vec<String>>,
    failing_runs: HashSet<String>,
    failing_removals: HashSet<String>,
    /// id -> options of containers not yet removed
    live: BTreeMap<String, RunOptions>,
    events: Vec<RuntimeEvent>,
}

/// In-memory [`ContainerRuntime`]. Scripts are keyed by image.
#[derive(Default)]
pub struct ScriptedRuntime {
    state: Mutex<ScriptState>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Containers of `image` exit with `code` (the default is 0).
    pub fn exit_with(&self, image: &str, code: i64) {
        self.script(image, ExitScript::Code(code));
    }

    pub fn script(&self, image: &str, script: ExitScript) {
        self.lock().exits.insert(image.to_string(), script);
    }

    /// Output containers of `image` print before exiting.
    pub fn print(&self, image: &str, lines: &[&str]) {
        self.lock().logs.insert(
            image.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
    }

    /// `run` of `image` fails.
    pub fn fail_run(&self, image: &str) {
        self.lock().failing_runs.insert(image.to_string());
    }

    /// `remove` of containers of `image` fails; the container stays live.
    pub fn fail_remove(&self, image: &str) {
        self.lock().failing_removals.insert(image.to_string());
    }

    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.lock().events.clone()
    }

    /// Options of every container started so far.
    pub fn started(&self) -> Vec<RunOptions> {
        self.lock()
            .events
            .iter()
            .filter_map(|event| match event {
                RuntimeEvent::Run {
                    name,
                    image,
                    links,
                    volume_binds,
                    env,
                    ..
                } => Some(RunOptions {
                    name: name.clone(),
                    image: image.clone(),
                    env: env.clone(),
                    volume_binds: volume_binds.clone(),
                    links: links.clone(),
                }),
                RuntimeEvent::Remove { .. } => None,
            })
            .collect()
    }

    /// Images of removed containers, in removal order.
    pub fn removed_images(&self) -> Vec<String> {
        self.lock()
            .events
            .iter()
            .filter_map(|event| match event {
                RuntimeEvent::Remove { image, .. } => Some(image.clone()),
                RuntimeEvent::Run { .. } => None,
            })
            .collect()
    }

    /// Images of containers that were started and never removed.
    pub fn live_containers(&self) -> Vec<String> {
        self.lock()
            .live
            .values()
            .map(|options| options.image.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn run(&self, options: &RunOptions) -> RuntimeResult<ContainerHandle> {
        let mut state = self.lock();
        if state.failing_runs.contains(&options.image) {
            return Err(RuntimeError::CommandFailed {
                command: "docker run".to_string(),
                code: Some(125),
                stderr: format!("Unable to find image '{}'", options.image),
            });
        }
        if let Some(name) = &options.name {
            if state.live.values().any(|live| live.name.as_ref() == Some(name)) {
                return Err(RuntimeError::NameConflict(name.clone()));
            }
        }

        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        state.live.insert(id.clone(), options.clone());
        state.events.push(RuntimeEvent::Run {
            id: id.clone(),
            name: options.name.clone(),
            image: options.image.clone(),
            links: options.links.clone(),
            volume_binds: options.volume_binds.clone(),
            env: options.env.clone(),
        });
        Ok(ContainerHandle {
            id,
            name: options.name.clone(),
            image: options.image.clone(),
        })
    }

    async fn stream_logs(&self, handle: &ContainerHandle) -> RuntimeResult<LogStream> {
        let lines = self
            .lock()
            .logs
            .get(&handle.image)
            .cloned()
            .unwrap_or_default();
        Ok(stream::iter(lines).boxed())
    }

    async fn wait(&self, handle: &ContainerHandle) -> RuntimeResult<i64> {
        let script = {
            let state = self.lock();
            if !state.live.contains_key(&handle.id) {
                return Err(RuntimeError::NotFound(handle.id.clone()));
            }
            state
                .exits
                .get(&handle.image)
                .cloned()
                .unwrap_or(ExitScript::Code(0))
        };
        match script {
            ExitScript::Code(code) => Ok(code),
            ExitScript::Delayed { code, after } => {
                tokio::time::sleep(after).await;
                Ok(code)
            }
            ExitScript::Hang => std::future::pending().await,
            ExitScript::WaitError => Err(RuntimeError::CommandFailed {
                command: "docker wait".to_string(),
                code: Some(1),
                stderr: "connection to daemon lost".to_string(),
            }),
        }
    }

    async fn remove(&self, handle: ContainerHandle, _options: RemoveOptions) -> RuntimeResult<()> {
        let mut state = self.lock();
        if !state.live.contains_key(&handle.id) {
            return Err(RuntimeError::NotFound(handle.id));
        }
        if state.failing_removals.contains(&handle.image) {
            return Err(RuntimeError::CommandFailed {
                command: "docker rm".to_string(),
                code: Some(1),
                stderr: format!("removal of container {} is already in progress", handle.id),
            });
        }
        state.live.remove(&handle.id);
        state.events.push(RuntimeEvent::Remove {
            id: handle.id,
            image: handle.image,
        });
        Ok(())
    }
}

/// Fetcher that succeeds, or fails with a fixed reason.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    failure: Option<String>,
}

impl StaticFetcher {
    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
        }
    }
}

#[async_trait]
impl SourceFetcher for StaticFetcher {
    async fn fetch(&self, _config: &PipelineConfig) -> Result<(), StageError> {
        match &self.failure {
            Some(reason) => Err(StageError::new(Stage::Fetch, reason.clone())),
            None => Ok(()),
        }
    }
}

/// Builder that tags every variant like the Docker builder would, except
/// the variants told to fail.
#[derive(Default)]
pub struct ScriptedBuilder {
    failing: Mutex<HashSet<u32>>,
    broken: Mutex<Option<String>>,
    built: Mutex<Vec<u32>>,
}

impl ScriptedBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The image of variant `number` does not build.
    pub fn fail_variant(&self, number: u32) {
        self.failing.lock().unwrap().insert(number);
    }

    /// The builder itself is unusable.
    pub fn break_builder(&self, reason: &str) {
        *self.broken.lock().unwrap() = Some(reason.to_string());
    }

    /// Variant numbers the builder was asked to build, in call order.
    pub fn built(&self) -> Vec<u32> {
        self.built.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageBuilder for ScriptedBuilder {
    async fn build(
        &self,
        config: &PipelineConfig,
        variant: &VariantSpec,
    ) -> Result<BuildOutcome, StageError> {
        if let Some(reason) = self.broken.lock().unwrap().clone() {
            return Err(StageError::new(Stage::Build, reason));
        }
        self.built.lock().unwrap().push(variant.number);
        if self.failing.lock().unwrap().contains(&variant.number) {
            return Ok(BuildOutcome::Failed {
                number: variant.number,
                reason: "The command '/bin/sh -c make' returned a non-zero code: 2".to_string(),
            });
        }
        Ok(BuildOutcome::Built {
            number: variant.number,
            image: image_tag(&config.project_id, config.job_id.as_str(), variant.number),
        })
    }
}
