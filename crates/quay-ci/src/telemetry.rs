//! Tracing initialisation for quay binaries.
//!
//! Besides printing to stdout, the orchestrator's own events are recorded in
//! the job's log through [`job_log_layer`], under the [`JOB_LOG_IMAGE`]
//! image. The layer only queues entries; a [`JobLogForwarder`] task feeds
//! them to the store, so emitting an event never waits on persistence.

use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Utc;
use quay_state::{JobId, LogEntry, LogSink};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{warn, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as fmt_layer, EnvFilter};

use crate::logs::CONTAINER_TARGET;

/// Image name under which orchestrator events are stored.
pub const JOB_LOG_IMAGE: &str = "quay/orchestration";

/// Target of the forwarder's own diagnostics, never fed back into the job log.
const FORWARDER_TARGET: &str = "quay::job_log";

/// Install the global subscriber.
///
/// * `json` - emit newline-delimited JSON instead of human-readable lines.
/// * `level` - default verbosity when `RUST_LOG` is not set.
/// * `job_log` - also record quay's own events in the job log.
///
/// Container output is logged under the `quay::container` target, so
/// `RUST_LOG=quay::container=off` silences it without hiding pipeline events.
/// Later calls are ignored because the global subscriber can only be
/// installed once per process.
pub fn init_tracing(json: bool, level: Level, job_log: Option<JobLogLayer>) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer::layer().json())
            .with(job_log)
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer::layer())
            .with(job_log)
            .try_init()
            .ok();
    }
}

/// Create the job log layer and the queue it writes into.
///
/// Events queue up until [`JobLogQueue::spawn_forwarder`] is given a sink,
/// so the layer can be installed before the store is open.
pub fn job_log_layer(
    project_id: impl Into<String>,
    job_id: JobId,
) -> (JobLogLayer, JobLogQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let layer = JobLogLayer {
        tx,
        project_id: project_id.into(),
        job_id,
    };
    (layer, JobLogQueue { rx })
}

/// Turns quay's tracing events into [`LogEntry`] values for one job.
///
/// Only events from quay crates are kept. Container output is skipped since
/// it is already stored per variant.
pub struct JobLogLayer {
    tx: mpsc::UnboundedSender<LogEntry>,
    project_id: String,
    job_id: JobId,
}

impl JobLogLayer {
    fn accepts(target: &str) -> bool {
        target.starts_with("quay") && target != CONTAINER_TARGET && target != FORWARDER_TARGET
    }
}

impl<S: Subscriber> Layer<S> for JobLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !Self::accepts(metadata.target()) {
            return;
        }

        let mut text = EventText::default();
        event.record(&mut text);
        // The receiver is gone once the forwarder has shut down.
        let _ = self.tx.send(LogEntry {
            project_id: self.project_id.clone(),
            job_id: self.job_id.clone(),
            variant_id: None,
            image: JOB_LOG_IMAGE.to_string(),
            message: text.render(*metadata.level()),
            timestamp: Utc::now(),
        });
    }
}

#[derive(Default)]
struct EventText {
    message: String,
    fields: String,
}

impl EventText {
    fn push(&mut self, field: &Field, value: fmt::Arguments<'_>) {
        if field.name() == "message" {
            let _ = self.message.write_fmt(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn render(self, level: Level) -> String {
        format!("{level} {}{}", self.message, self.fields)
    }
}

impl Visit for EventText {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, format_args!("{value}"));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, format_args!("{value:?}"));
    }
}

/// Entries emitted by a [`JobLogLayer`] that are not yet stored.
pub struct JobLogQueue {
    rx: mpsc::UnboundedReceiver<LogEntry>,
}

impl JobLogQueue {
    /// Start feeding queued and future entries to `sink`.
    pub fn spawn_forwarder(self, sink: Arc<dyn LogSink>) -> JobLogForwarder {
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(forward(self.rx, sink, stop_rx));
        JobLogForwarder {
            stop: stop_tx,
            handle,
        }
    }
}

/// Background task storing job log entries.
pub struct JobLogForwarder {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl JobLogForwarder {
    /// Store everything queued so far, then stop.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.handle.await {
            warn!(target: FORWARDER_TARGET, error = %e, "job log forwarder panicked");
        }
    }
}

async fn forward(
    mut rx: mpsc::UnboundedReceiver<LogEntry>,
    sink: Arc<dyn LogSink>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            entry = rx.recv() => match entry {
                Some(entry) => store(sink.as_ref(), entry).await,
                None => return,
            },
            _ = &mut stop => break,
        }
    }
    while let Ok(entry) = rx.try_recv() {
        store(sink.as_ref(), entry).await;
    }
}

async fn store(sink: &dyn LogSink, entry: LogEntry) {
    if let Err(e) = sink.feed(entry).await {
        warn!(target: FORWARDER_TARGET, error = %e, "failed to store job log entry");
    }
}
