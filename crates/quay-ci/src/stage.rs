//! Pipeline stages and the one-shot stage container they share.

use std::fmt;
use std::sync::Arc;

use quay_state::LogSink;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StageError;
use crate::logs::{forward_logs, LogSource};
use crate::runtime::{ContainerHandle, ContainerRuntime, RemoveOptions, RunOptions};

/// The fixed pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Parse,
    Build,
    Run,
}

impl Stage {
    pub const ORDER: [Stage; 4] = [Stage::Fetch, Stage::Parse, Stage::Build, Stage::Run];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Parse => "parse",
            Stage::Build => "build",
            Stage::Run => "run",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Start a single stage container, forward its logs and wait for it.
///
/// Returns the still-present container together with its exit code; the
/// caller decides whether to remove or keep it. If the container cannot be
/// followed or waited on, it is removed before the error is returned.
pub(crate) async fn run_stage_container(
    runtime: &dyn ContainerRuntime,
    logs: Arc<dyn LogSink>,
    stage: Stage,
    options: &RunOptions,
    source: LogSource,
) -> Result<(ContainerHandle, i64), StageError> {
    let handle = runtime
        .run(options)
        .await
        .map_err(|e| StageError::new(stage, format!("failed to start {}: {e}", options.image)))?;
    debug!(
        stage = %stage,
        container = %handle.short_id(),
        image = %handle.image,
        "stage container started"
    );

    let stream = match runtime.stream_logs(&handle).await {
        Ok(stream) => stream,
        Err(e) => {
            let err = StageError::new(stage, format!("failed to follow logs: {e}"))
                .with_container(&handle.id);
            discard(runtime, handle, stage).await;
            return Err(err);
        }
    };

    let (_, exit) = tokio::join!(forward_logs(stream, logs, source), runtime.wait(&handle));
    match exit {
        Ok(code) => Ok((handle, code)),
        Err(e) => {
            let err = StageError::new(stage, format!("failed to wait for container: {e}"))
                .with_container(&handle.id);
            discard(runtime, handle, stage).await;
            Err(err)
        }
    }
}

/// Remove a stage container after a successful exit.
pub(crate) async fn remove_stage_container(
    runtime: &dyn ContainerRuntime,
    handle: ContainerHandle,
    stage: Stage,
) -> Result<(), StageError> {
    let id = handle.id.clone();
    runtime
        .remove(handle, RemoveOptions::purge())
        .await
        .map_err(|e| {
            StageError::new(stage, format!("failed to remove container: {e}")).with_container(id)
        })
}

async fn discard(runtime: &dyn ContainerRuntime, handle: ContainerHandle, stage: Stage) {
    let id = handle.id.clone();
    if let Err(e) = runtime.remove(handle, RemoveOptions::purge()).await {
        warn!(stage = %stage, container = %id, error = %e, "failed to remove stage container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_display_lowercase_in_order() {
        let names: Vec<String> = Stage::ORDER.iter().map(Stage::to_string).collect();
        assert_eq!(names, vec!["fetch", "parse", "build", "run"]);
    }

    #[test]
    fn stage_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Stage::Parse).unwrap(), "\"parse\"");
    }
}
