//! Docker implementation of [`ContainerRuntime`] driving the `docker` CLI.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::runtime::{
    ContainerHandle, ContainerRuntime, LogStream, RemoveOptions, RunOptions, RuntimeError,
    RuntimeResult,
};

/// Talks to the Docker daemon through the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCliRuntime {
    binary: String,
    host: Option<String>,
}

impl Default for DockerCliRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCliRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            host: None,
        }
    }

    /// Target a specific daemon (`-H`), e.g. `unix:///var/run/docker.sock`.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Build `context/Dockerfile` into `tag`.
    ///
    /// A failed build is `RuntimeError::CommandFailed`; a missing binary is
    /// `RuntimeError::Spawn`.
    pub async fn build_image(&self, tag: &str, context: &Path) -> RuntimeResult<()> {
        let args = vec![
            "build".to_string(),
            "--tag".to_string(),
            tag.to_string(),
            context.display().to_string(),
        ];
        self.output(args).await.map(|_| ())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(host) = &self.host {
            cmd.arg("-H").arg(host);
        }
        cmd
    }

    /// Run a docker subcommand to completion and return its trimmed stdout.
    async fn output(&self, args: Vec<String>) -> RuntimeResult<String> {
        let subcommand = args.first().map(String::as_str).unwrap_or_default();
        let command = format!("{} {}", self.binary, subcommand);
        debug!(command = %command, args = ?args, "invoking docker");

        let output = self
            .command()
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Arguments for `docker run`.
fn run_args(options: &RunOptions) -> Vec<String> {
    let mut args = vec!["run".to_string(), "--detach".to_string()];
    if let Some(name) = &options.name {
        args.push("--name".to_string());
        args.push(name.clone());
    }
    for (key, value) in &options.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    for bind in &options.volume_binds {
        args.push("--volume".to_string());
        args.push(bind.clone());
    }
    for link in &options.links {
        args.push("--link".to_string());
        args.push(link.clone());
    }
    args.push(options.image.clone());
    args
}

/// Arguments for `docker rm`.
fn remove_args(id: &str, options: RemoveOptions) -> Vec<String> {
    let mut args = vec!["rm".to_string()];
    if options.force {
        args.push("--force".to_string());
    }
    if options.remove_volumes {
        args.push("--volumes".to_string());
    }
    args.push(id.to_string());
    args
}

/// Splits container output into lines.
///
/// Bytes that are not valid UTF-8 are replaced rather than ending the stream.
fn lines<R>(reader: R) -> LogStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(BufReader::new(reader), |mut reader| async move {
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => None,
            Ok(_) => {
                if buf.ends_with(b"\n") {
                    buf.pop();
                }
                if buf.ends_with(b"\r") {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                Some((line, reader))
            }
            Err(e) => {
                warn!(error = %e, "container log stream failed");
                None
            }
        }
    })
    .boxed()
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    async fn run(&self, options: &RunOptions) -> RuntimeResult<ContainerHandle> {
        let stdout = self.output(run_args(options)).await?;
        // Pull progress goes to stderr; the id is the last stdout line.
        let id = stdout
            .lines()
            .last()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                RuntimeError::InvalidOutput("docker run printed no container id".into())
            })?;

        Ok(ContainerHandle {
            id: id.to_string(),
            name: options.name.clone(),
            image: options.image.clone(),
        })
    }

    async fn stream_logs(&self, handle: &ContainerHandle) -> RuntimeResult<LogStream> {
        let mut child = self
            .command()
            .args(["logs", "--follow", handle.id.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                command: format!("{} logs", self.binary),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::InvalidOutput("docker logs stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RuntimeError::InvalidOutput("docker logs stderr not captured".into()))?;

        // Reap the follower once both pipes are drained.
        let reaper = stream::once(async move {
            let _ = child.wait().await;
        })
        .filter_map(|()| futures::future::ready(None::<String>));

        Ok(stream::select(lines(stdout), lines(stderr))
            .chain(reaper)
            .boxed())
    }

    async fn wait(&self, handle: &ContainerHandle) -> RuntimeResult<i64> {
        let stdout = self
            .output(vec!["wait".to_string(), handle.id.clone()])
            .await?;
        stdout
            .lines()
            .last()
            .and_then(|code| code.trim().parse::<i64>().ok())
            .ok_or_else(|| RuntimeError::InvalidOutput(format!("docker wait printed '{stdout}'")))
    }

    async fn remove(&self, handle: ContainerHandle, options: RemoveOptions) -> RuntimeResult<()> {
        self.output(remove_args(&handle.id, options)).await.map(|_| ())
    }
}
